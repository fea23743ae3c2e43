//! Parameters file parsing and the recognized boolean/numeric options
//! (`spec.md` §6 Parameters table).
//!
//! Parsed with the same line-oriented reader as [`crate::dictionary`]
//! (`KEY value`, `#` comments, `\`-continuation); values are interpreted as
//! bool/int per option. Unknown options are a WARNING and ignored
//! (supplemental tolerance, `SPEC_FULL.md` §5, so configs stay
//! forward-compatible across engine versions).

use crate::dictionary::Dictionary;

/// Runtime-tunable knobs, defaults per `spec.md` §6.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub debug: bool,
    pub bytecode: bool,
    pub errorfragment: bool,
    pub logtooutput: bool,
    pub watchfiles: bool,
    pub maxincludedepth: i64,
    pub maxdebugvallength: i64,
    pub format: bool,
    pub alwaysescape: bool,
    pub printescape: bool,
    pub shorttag: bool,
    /// Arbitrary additional `KEY value` entries not recognized as a named
    /// option, queried via the `isenabled`/`getdict` builtins
    /// (`original_source/src/tengfunctionother.h`).
    extra: Dictionary,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            debug: false,
            bytecode: false,
            errorfragment: false,
            logtooutput: false,
            watchfiles: true,
            maxincludedepth: 10,
            maxdebugvallength: 40,
            format: true,
            alwaysescape: true,
            printescape: true,
            shorttag: true,
            extra: Dictionary::new(),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

impl Configuration {
    pub fn parse(text: &str, warnings: &mut Vec<String>) -> Configuration {
        let dict = Dictionary::parse(text, warnings);
        let mut cfg = Configuration::default();

        macro_rules! bool_opt {
            ($key:literal, $field:ident) => {
                if let Some(raw) = dict.lookup($key) {
                    match parse_bool(raw) {
                        Some(v) => cfg.$field = v,
                        None => warnings.push(format!("option '{}': invalid bool value '{}'", $key, raw)),
                    }
                }
            };
        }
        macro_rules! int_opt {
            ($key:literal, $field:ident) => {
                if let Some(raw) = dict.lookup($key) {
                    match raw.trim().parse::<i64>() {
                        Ok(v) => cfg.$field = v,
                        Err(_) => warnings.push(format!("option '{}': invalid integer value '{}'", $key, raw)),
                    }
                }
            };
        }

        bool_opt!("debug", debug);
        bool_opt!("bytecode", bytecode);
        bool_opt!("errorfragment", errorfragment);
        bool_opt!("logtooutput", logtooutput);
        bool_opt!("watchfiles", watchfiles);
        int_opt!("maxincludedepth", maxincludedepth);
        int_opt!("maxdebugvallength", maxdebugvallength);
        bool_opt!("format", format);
        bool_opt!("alwaysescape", alwaysescape);
        bool_opt!("printescape", printescape);
        bool_opt!("shorttag", shorttag);

        const KNOWN: &[&str] = &[
            "debug", "bytecode", "errorfragment", "logtooutput", "watchfiles",
            "maxincludedepth", "maxdebugvallength", "format", "alwaysescape",
            "printescape", "shorttag",
        ];
        let mut extra = Dictionary::new();
        for (key, _) in dict_entries(&dict) {
            if !KNOWN.contains(&key.as_str()) {
                extra.insert(key.clone(), dict.lookup(&key).unwrap().to_string());
            }
        }
        cfg.extra = extra;
        cfg
    }

    /// `isenabled` builtin support: arbitrary feature flags beyond the
    /// named options, looked up in the leftover dictionary entries.
    pub fn is_enabled(&self, feature: &str) -> Option<bool> {
        self.extra.lookup(feature).and_then(parse_bool)
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.extra.lookup(key)
    }
}

/// `Dictionary` doesn't expose iteration (its entries are queried by key
/// only in the hot path); this helper walks the text a second time only
/// when partitioning known vs. extra options, which happens once per parse.
fn dict_entries(dict: &Dictionary) -> Vec<(String, String)> {
    dict.entries_snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Configuration::default();
        assert!(!cfg.debug);
        assert!(cfg.watchfiles);
        assert_eq!(cfg.maxincludedepth, 10);
        assert_eq!(cfg.maxdebugvallength, 40);
        assert!(cfg.alwaysescape);
    }

    #[test]
    fn parses_overrides_and_extra_feature_flags() {
        let mut warnings = Vec::new();
        let cfg = Configuration::parse(
            "debug on\nmaxincludedepth 5\nmyfeature true\n",
            &mut warnings,
        );
        assert!(warnings.is_empty());
        assert!(cfg.debug);
        assert_eq!(cfg.maxincludedepth, 5);
        assert_eq!(cfg.is_enabled("myfeature"), Some(true));
    }

    #[test]
    fn invalid_bool_warns_and_keeps_default() {
        let mut warnings = Vec::new();
        let cfg = Configuration::parse("debug maybe\n", &mut warnings);
        assert_eq!(warnings.len(), 1);
        assert!(!cfg.debug);
    }
}
