//! Integration tests for the top-level [`teng::generate`] façade: exercise
//! it the way a host actually would, through [`TemplateCache`] and a
//! [`FragmentBuilder`]-built tree, rather than reaching into `Processor`
//! directly (that's covered by each module's own `#[cfg(test)]`).

use std::io::Write;
use std::rc::Rc;

use teng::cache::{FsSource, TemplateCache};
use teng::content_type::ContentTypeRegistry;
use teng::fragment::FragmentBuilder;
use teng::writer::StringWriter;
use teng::{generate, GenerateRequest, TemplateSource};

fn render_inline(src: &str, root: Rc<teng::fragment::Fragment>) -> (i32, String, teng::ErrorLog) {
    let cache = TemplateCache::new(FsSource, 10, true, true);
    let content_types = ContentTypeRegistry::builtin();
    let req = GenerateRequest {
        template: TemplateSource::Inline(src),
        dict_filename: None,
        params_filename: None,
        content_type: "text/html",
        root,
    };
    let mut writer = StringWriter::new();
    let (status, errors) = generate(&cache, &content_types, req, &mut writer).unwrap();
    (status, writer.into_string(), errors)
}

#[test]
fn inline_template_renders_and_reports_ok_status() {
    let (status, out, errors) = render_inline("hello world", Rc::new(FragmentBuilder::new().build()));
    assert_eq!(status, 0);
    assert_eq!(out, "hello world");
    assert!(errors.is_empty());
}

#[test]
fn division_by_zero_keeps_status_zero_but_logs_a_warning() {
    // Division/modulo failures are logged as WARNING and substitute
    // undefined rather than aborting the render (spec.md §4.3).
    let (status, out, errors) = render_inline("${1/0}", Rc::new(FragmentBuilder::new().build()));
    assert_eq!(status, 0);
    assert_eq!(out, "undefined");
    assert!(!errors.is_empty());
    assert!(!errors.has_errors());
    assert!(!errors.has_fatal());
}

#[test]
fn frag_list_positional_builtins_sum_to_one_first_and_last() {
    let mut b = FragmentBuilder::new();
    b.list("items", 4);
    let root = Rc::new(b.build());
    let src = "<?teng frag items?>${_first}${_last}${_inner}/${_index}:${_count};<?teng endfrag?>";
    let (_, out, errors) = render_inline(src, root);
    assert!(errors.is_empty(), "{:?}", errors.entries());
    assert_eq!(out, "100/0:4;001/1:4;001/2:4;010/3:4;");
}

#[test]
fn html_content_type_escapes_by_default() {
    let mut b = FragmentBuilder::new();
    b.set_str("html", "<b>&");
    let root = Rc::new(b.build());
    let (_, out, _) = render_inline("${html}", root);
    assert_eq!(out, "&lt;b&gt;&amp;");
}

#[test]
fn dictionary_file_is_loaded_through_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let dict_path = dir.path().join("strings.dict");
    std::fs::write(&dict_path, "greeting Hello, world!\n").unwrap();

    let cache = TemplateCache::new(FsSource, 10, true, true);
    let content_types = ContentTypeRegistry::builtin();
    let req = GenerateRequest {
        template: TemplateSource::Inline("${dict('greeting')}"),
        dict_filename: Some(dict_path.to_str().unwrap()),
        params_filename: None,
        content_type: "text/html",
        root: Rc::new(FragmentBuilder::new().build()),
    };
    let mut writer = StringWriter::new();
    let (status, errors) = generate(&cache, &content_types, req, &mut writer).unwrap();
    assert_eq!(status, 0);
    assert!(errors.is_empty(), "{:?}", errors.entries());
    assert_eq!(writer.into_string(), "Hello, world!");
}

#[test]
fn file_template_with_include_resolves_through_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let included = dir.path().join("greeting.teng");
    std::fs::write(&included, "hello").unwrap();
    let main = dir.path().join("main.teng");
    std::fs::write(&main, format!("<?teng include file='{}'?>, world!", included.to_str().unwrap())).unwrap();

    let cache = TemplateCache::new(FsSource, 10, true, true);
    let content_types = ContentTypeRegistry::builtin();
    let req = GenerateRequest {
        template: TemplateSource::File(main.to_str().unwrap()),
        dict_filename: None,
        params_filename: None,
        content_type: "text/html",
        root: Rc::new(FragmentBuilder::new().build()),
    };
    let mut writer = StringWriter::new();
    let (status, errors) = generate(&cache, &content_types, req, &mut writer).unwrap();
    assert_eq!(status, 0);
    assert!(errors.is_empty(), "{:?}", errors.entries());
    assert_eq!(writer.into_string(), "hello, world!");
}

#[test]
fn cached_program_is_rebuilt_after_file_is_touched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.teng");
    std::fs::write(&path, "one").unwrap();

    let cache = TemplateCache::new(FsSource, 10, true, true);
    let content_types = ContentTypeRegistry::builtin();
    let request = |root| GenerateRequest {
        template: TemplateSource::File(path.to_str().unwrap()),
        dict_filename: None,
        params_filename: None,
        content_type: "text/html",
        root,
    };

    let mut writer = StringWriter::new();
    generate(&cache, &content_types, request(Rc::new(FragmentBuilder::new().build())), &mut writer).unwrap();
    assert_eq!(writer.into_string(), "one");

    // Rewriting with a different size is enough to trip the mtime+size
    // staleness check even on filesystems with coarse mtime resolution
    // (spec.md §4.7).
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let mut f = std::fs::OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
    f.write_all(b"two!").unwrap();
    drop(f);

    let mut writer = StringWriter::new();
    generate(&cache, &content_types, request(Rc::new(FragmentBuilder::new().build())), &mut writer).unwrap();
    assert_eq!(writer.into_string(), "two!");
}

#[test]
fn missing_template_file_is_a_cache_error_not_a_panic() {
    let cache = TemplateCache::new(FsSource, 10, true, true);
    let content_types = ContentTypeRegistry::builtin();
    let req = GenerateRequest {
        template: TemplateSource::File("/no/such/path.teng"),
        dict_filename: None,
        params_filename: None,
        content_type: "text/html",
        root: Rc::new(FragmentBuilder::new().build()),
    };
    let mut writer = StringWriter::new();
    assert!(generate(&cache, &content_types, req, &mut writer).is_err());
}
