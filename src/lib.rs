//! # teng
//!
//! A general-purpose text templating engine: a lexer and single-pass
//! bytecode compiler (`parser`) feeding a stack-based VM (`processor`) that
//! renders a [`Program`] against a host-supplied fragment tree.
//!
//! [`generate`] is the top-level entry point (`spec.md` §6 "Generate
//! request"): it resolves a template (and its dictionary/parameters,
//! optionally cached) and drives one render into a [`Writer`].

pub mod builtins;
pub mod cache;
pub mod config;
pub mod content_type;
pub mod dictionary;
pub mod error;
pub mod format;
pub mod fragment;
pub mod fragment_stack;
pub mod lexer;
pub mod parser;
pub mod processor;
pub mod program;
pub mod udf;
pub mod value;
pub mod writer;

pub use cache::{CacheError, FileSource, FsSource, TemplateCache};
pub use config::Configuration;
pub use content_type::ContentTypeRegistry;
pub use dictionary::Dictionary;
pub use error::{Entry, ErrorLog, Level, Pos};
pub use fragment::{Fragment, FragmentBuilder, FragmentList};
pub use processor::Processor;
pub use program::Program;
pub use value::Value;
pub use writer::{FileWriter, StringWriter, Writer};

use std::rc::Rc;

/// Where a template comes from for one [`generate`] call (`spec.md` §6
/// "templateFilename | templateString").
pub enum TemplateSource<'a> {
    File(&'a str),
    Inline(&'a str),
}

/// One `generate` call's inputs (`spec.md` §6 "Generate request (logical
/// API)"). `skin`/`lang`/`encoding` are left to the host to fold into
/// `dict_filename`/`params_filename` paths and `root`'s content, since this
/// crate has no opinion on directory layout or locale resolution.
pub struct GenerateRequest<'a> {
    pub template: TemplateSource<'a>,
    pub dict_filename: Option<&'a str>,
    pub params_filename: Option<&'a str>,
    pub content_type: &'a str,
    pub root: Rc<Fragment>,
}

/// Resolve `req` (through `cache`, when a filename is given) and render it
/// into `writer`. Returns the generate status (`spec.md` §6: "0 ok,
/// non-zero on fatal") alongside the accumulated [`ErrorLog`]; an `Err` only
/// for a failure to even read the top-level template/dict/params file
/// (`spec.md` §7 "I/O on input: fail compilation with ERROR").
pub fn generate<F: FileSource>(
    cache: &TemplateCache<F>,
    content_types: &ContentTypeRegistry,
    req: GenerateRequest,
    writer: &mut dyn Writer,
) -> Result<(i32, ErrorLog), CacheError> {
    let config_rc = match req.params_filename {
        Some(p) => cache.get_config(p)?,
        None => Rc::new(Configuration::default()),
    };
    let dict_rc = match req.dict_filename {
        Some(p) => cache.get_dict(p)?,
        None => Rc::new(Dictionary::new()),
    };
    let mut inline_compile_errors = None;
    let program_rc = match &req.template {
        TemplateSource::File(path) => cache.get_program(path)?,
        TemplateSource::Inline(src) => {
            let result = parser::parse_template(src, "<inline>", config_rc.shorttag);
            inline_compile_errors = Some(result.errors);
            Rc::new(result.program)
        }
    };

    let status;
    let mut errors;
    {
        let mut proc = Processor::new(
            &program_rc,
            req.root,
            &dict_rc,
            &config_rc,
            content_types,
            req.content_type,
            writer,
            Some(cache as &dyn processor::IncludeLoader),
        );
        let run_errors = proc.run();
        status = if run_errors.has_fatal() { 1 } else { 0 };
        errors = run_errors.clone();
    }
    match &req.template {
        TemplateSource::File(path) => {
            if let Some(compile_errors) = cache.program_errors(path) {
                errors.extend(&compile_errors);
            }
        }
        TemplateSource::Inline(_) => {
            if let Some(compile_errors) = inline_compile_errors {
                errors.extend(&compile_errors);
            }
        }
    }
    if config_rc.logtooutput {
        let _ = writer.write(format!("{errors}").as_bytes());
    }
    Ok((status, errors))
}
