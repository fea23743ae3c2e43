use std::hint::black_box;
use std::rc::Rc;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use once_cell::sync::Lazy;

use teng::cache::{FsSource, TemplateCache};
use teng::content_type::ContentTypeRegistry;
use teng::fragment::FragmentBuilder;
use teng::parser::parse_template;
use teng::processor::Processor;
use teng::writer::StringWriter;
use teng::{Configuration, Dictionary};

// -----------------------------------------------------------------------------
// Test data
// -----------------------------------------------------------------------------

const SMALL_TEMPLATE: &str = "<?teng frag items?>${name}: ${_index}/${_count}\n<?teng endfrag?>";
static LARGE_TEMPLATE: Lazy<String> = Lazy::new(|| SMALL_TEMPLATE.repeat(50));

fn root_with_items(count: usize) -> Rc<teng::fragment::Fragment> {
    let mut b = FragmentBuilder::new();
    let items = b.list("items", count);
    for (i, item) in items.iter_mut().enumerate() {
        item.set_str("name", format!("item-{i}"));
    }
    Rc::new(b.build())
}

// -----------------------------------------------------------------------------
// 1. Compilation – how fast the parser turns source into bytecode.
// -----------------------------------------------------------------------------

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    group.bench_function("small", |b| {
        b.iter(|| parse_template(black_box(SMALL_TEMPLATE), "<bench>", true))
    });
    group.bench_function("large", |b| {
        b.iter(|| parse_template(black_box(&LARGE_TEMPLATE), "<bench>", true))
    });
    group.finish();
}

// -----------------------------------------------------------------------------
// 2. Execution – rendering an already-compiled Program against a fragment
//    tree of varying size.
// -----------------------------------------------------------------------------

fn bench_render(c: &mut Criterion) {
    let result = parse_template(SMALL_TEMPLATE, "<bench>", true);
    let dict = Dictionary::new();
    let config = Configuration::default();
    let content_types = ContentTypeRegistry::builtin();

    let mut group = c.benchmark_group("render");
    for count in [10usize, 100, 1000] {
        let root = root_with_items(count);
        group.bench_function(format!("items_{count}"), |b| {
            b.iter(|| {
                let mut writer = StringWriter::new();
                {
                    let mut proc = Processor::new(
                        &result.program,
                        black_box(root.clone()),
                        &dict,
                        &config,
                        &content_types,
                        "text/html",
                        &mut writer,
                        None,
                    );
                    proc.run();
                }
                writer.into_string()
            })
        });
    }
    group.finish();
}

// -----------------------------------------------------------------------------
// 3. Cache effectiveness – cold compile vs. cache hit through TemplateCache.
// -----------------------------------------------------------------------------

fn bench_cache(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.teng");
    std::fs::write(&path, SMALL_TEMPLATE).unwrap();
    let path = path.to_str().unwrap().to_string();

    let mut group = c.benchmark_group("template_cache");
    group.bench_function("cold_compile", |b| {
        b.iter(|| {
            let cache = TemplateCache::new(FsSource, 50, true, true);
            cache.get_program(black_box(&path)).unwrap()
        })
    });

    let warm_cache = TemplateCache::new(FsSource, 50, true, true);
    warm_cache.get_program(&path).unwrap();
    group.bench_function("warm_hit", |b| {
        b.iter(|| warm_cache.get_program(black_box(&path)).unwrap())
    });
    group.finish();
}

// -----------------------------------------------------------------------------
// Criterion configuration & entry point
// -----------------------------------------------------------------------------

criterion_group! {
    name = benches;
    config = Criterion::default()
        .configure_from_args()
        .sample_size(100)
        .measurement_time(Duration::from_secs(5));
    targets = bench_compile, bench_render, bench_cache
}
criterion_main!(benches);
