//! Prompt-file library.
//!
//! An op may declare a source path; its prompts live in a sibling YAML file
//! named `<stem>_prompt.yaml`, where a `_op` stem suffix is replaced (so
//! `stream_chat_op.rs` reads `stream_chat_prompt.yaml`). The file is a flat
//! map of `prompt_name -> template`; templates use `{var}` placeholders.
//!
//! Locale fallback: with language `zh`, `prompt_format("foo", ...)` prefers
//! the `foo_zh` entry over `foo`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use flowllm_core::{FlowError, FlowResult};

/// Loaded prompt templates for one op.
#[derive(Debug, Default, Clone)]
pub struct PromptLibrary {
    prompts: BTreeMap<String, String>,
    language: String,
}

impl PromptLibrary {
    /// An empty library; `format` fails for every name.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the prompt file that belongs to `op_path`, if it exists.
    ///
    /// A missing file yields an empty library, since most ops have no
    /// prompts. A present-but-invalid file is an error.
    pub fn load_for_op(op_path: &Path, language: impl Into<String>) -> FlowResult<Self> {
        let prompt_path = prompt_path_for(op_path);
        if !prompt_path.exists() {
            return Ok(PromptLibrary {
                prompts: BTreeMap::new(),
                language: language.into(),
            });
        }
        Self::load(&prompt_path, language)
    }

    /// Load an explicit prompt YAML file.
    pub fn load(path: &Path, language: impl Into<String>) -> FlowResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let prompts: BTreeMap<String, String> =
            serde_yaml::from_str(&contents).map_err(|e| FlowError::Parse {
                message: format!("invalid prompt file {}: {e}", path.display()),
            })?;
        Ok(PromptLibrary {
            prompts,
            language: language.into(),
        })
    }

    /// Build a library from in-memory entries (tests, inline ops).
    pub fn from_entries(
        entries: impl IntoIterator<Item = (String, String)>,
        language: impl Into<String>,
    ) -> Self {
        PromptLibrary {
            prompts: entries.into_iter().collect(),
            language: language.into(),
        }
    }

    /// Raw template by name, honoring the locale fallback.
    pub fn get(&self, name: &str) -> FlowResult<&str> {
        if !self.language.is_empty() {
            let localized = format!("{name}_{}", self.language);
            if let Some(template) = self.prompts.get(&localized) {
                return Ok(template);
            }
        }
        self.prompts
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| FlowError::Parse {
                message: format!("prompt `{name}` not found"),
            })
    }

    /// Render a template, substituting `{var}` placeholders from `vars`.
    ///
    /// `{{` and `}}` escape literal braces. Placeholders with no binding are
    /// an error; unused bindings are fine.
    pub fn format(&self, name: &str, vars: &BTreeMap<String, String>) -> FlowResult<String> {
        let template = self.get(name)?;
        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut key = String::new();
                    for c in chars.by_ref() {
                        if c == '}' {
                            break;
                        }
                        key.push(c);
                    }
                    let value = vars.get(&key).ok_or_else(|| FlowError::Parse {
                        message: format!("prompt `{name}`: no value for placeholder `{{{key}}}`"),
                    })?;
                    out.push_str(value);
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

/// Sibling prompt path for an op source path.
pub fn prompt_path_for(op_path: &Path) -> PathBuf {
    let stem = op_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let base = stem.strip_suffix("_op").unwrap_or(stem);
    op_path.with_file_name(format!("{base}_prompt.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_prompt_path_substitution() {
        assert_eq!(
            prompt_path_for(Path::new("ops/stream_chat_op.rs")),
            PathBuf::from("ops/stream_chat_prompt.yaml")
        );
        assert_eq!(
            prompt_path_for(Path::new("ops/summarize.rs")),
            PathBuf::from("ops/summarize_prompt.yaml")
        );
    }

    #[test]
    fn test_format_substitution() {
        let lib = PromptLibrary::from_entries(
            [(
                "greet".to_string(),
                "Hello {name}, you asked: {question}".to_string(),
            )],
            "",
        );
        let out = lib
            .format("greet", &vars(&[("name", "Ada"), ("question", "why?")]))
            .unwrap();
        assert_eq!(out, "Hello Ada, you asked: why?");
    }

    #[test]
    fn test_escaped_braces() {
        let lib =
            PromptLibrary::from_entries([("json".to_string(), "{{\"k\": {v}}}".to_string())], "");
        assert_eq!(lib.format("json", &vars(&[("v", "1")])).unwrap(), "{\"k\": 1}");
    }

    #[test]
    fn test_missing_placeholder_value() {
        let lib = PromptLibrary::from_entries([("p".to_string(), "{missing}".to_string())], "");
        assert!(lib.format("p", &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_locale_fallback() {
        let lib = PromptLibrary::from_entries(
            [
                ("greet".to_string(), "hello".to_string()),
                ("greet_zh".to_string(), "nihao".to_string()),
            ],
            "zh",
        );
        assert_eq!(lib.get("greet").unwrap(), "nihao");

        let en = PromptLibrary::from_entries([("greet".to_string(), "hello".to_string())], "zh");
        assert_eq!(en.get("greet").unwrap(), "hello");
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        write!(
            file,
            "system: |\n  You are a helpful assistant.\nuser: 'Question: {{question}}'\n"
        )
        .unwrap();

        let lib = PromptLibrary::load(file.path(), "").unwrap();
        assert!(lib.get("system").unwrap().contains("helpful assistant"));
        let rendered = lib.format("user", &vars(&[("question", "what?")])).unwrap();
        assert_eq!(rendered, "Question: what?");
    }
}
