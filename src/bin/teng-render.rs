//! Command-line driver for [`teng::generate`]: reads a template, an optional
//! JSON data file, dictionary and parameters files, renders to stdout or a
//! file. A thin demonstration of the library façade, not a feature surface
//! in its own right (`SPEC_FULL.md` §1).

use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;

use teng::cache::{FsSource, TemplateCache};
use teng::content_type::ContentTypeRegistry;
use teng::fragment::{fragment_from_json, Fragment};
use teng::writer::{FileWriter, StringWriter, Writer};
use teng::{generate, GenerateRequest, TemplateSource};

#[derive(Parser)]
#[command(about = "Render a teng template against a JSON data fragment")]
struct Cli {
    /// Path to the `.teng` template file.
    template: String,

    /// Path to a JSON file supplying the root fragment tree. Defaults to an
    /// empty fragment if omitted.
    #[arg(short, long)]
    data: Option<String>,

    /// Dictionary file (`KEY value` pairs, `spec.md` §6).
    #[arg(short = 'D', long)]
    dict: Option<String>,

    /// Parameters file (`spec.md` §6 Parameters table).
    #[arg(short, long)]
    params: Option<String>,

    /// Output MIME content type, selecting the escape/unescape table.
    #[arg(short, long, default_value = "text/html")]
    content_type: String,

    /// Write rendered output to this file instead of stdout.
    #[arg(short, long)]
    output: Option<String>,

    /// Per-cache capacity for compiled templates/dictionaries/params.
    #[arg(long, default_value_t = teng::cache::DEFAULT_CAPACITY)]
    cache_capacity: usize,

    /// Recompile a cached artifact when its source file's mtime/size change.
    #[arg(long, default_value_t = true)]
    watchfiles: bool,

    /// Accept `<?teng ...?>` short tag form `<? ... ?>`.
    #[arg(long, default_value_t = true)]
    shorttag: bool,
}

fn load_root(path: Option<&str>) -> Result<Rc<Fragment>, String> {
    match path {
        None => Ok(Rc::new(Fragment::new())),
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| format!("reading '{path}': {e}"))?;
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| format!("parsing '{path}': {e}"))?;
            let frag = fragment_from_json(&json).map_err(|e| format!("'{path}': {e}"))?;
            Ok(Rc::new(frag))
        }
    }
}

fn run(cli: Cli) -> Result<i32, String> {
    let root = load_root(cli.data.as_deref())?;
    let cache = TemplateCache::new(FsSource, cli.cache_capacity, cli.shorttag, cli.watchfiles);
    let content_types = ContentTypeRegistry::builtin();

    let req = GenerateRequest {
        template: TemplateSource::File(&cli.template),
        dict_filename: cli.dict.as_deref(),
        params_filename: cli.params.as_deref(),
        content_type: &cli.content_type,
        root,
    };

    let (status, errors) = match cli.output {
        Some(ref path) => {
            let mut writer = FileWriter::create(path).map_err(|e| format!("creating '{path}': {e}"))?;
            generate(&cache, &content_types, req, &mut writer).map_err(|e| e.to_string())?
        }
        None => {
            let mut writer = StringWriter::new();
            let result = generate(&cache, &content_types, req, &mut writer).map_err(|e| e.to_string())?;
            print!("{}", writer.into_string());
            result
        }
    };

    if !errors.is_empty() {
        eprint!("{errors}");
    }
    Ok(status)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
