//! Per-language inspection scripts.
//!
//! Each supported kernel language gets a bundle of code fragments: an init
//! script that defines helper functions in the kernel, plus short commands
//! that call them. Fragment text is trusted data and is not validated here.

use crate::error::InspectError;
use crate::language::KernelLanguage;

/// The code fragments used to inspect one kernel language.
#[derive(Debug)]
pub struct LanguageScripts {
    pub language: KernelLanguage,
    /// Defines the helpers. Run once per kernel process.
    pub init: &'static str,
    /// Returns the variable list as JSON.
    pub query: &'static str,
    /// Deletes every user variable, then returns the (empty) list.
    pub delete_all: &'static str,
    matrix_template: &'static str,
    widget_template: &'static str,
    delete_template: &'static str,
}

impl LanguageScripts {
    /// Command returning a table preview of `name`, capped at `max_rows`.
    pub fn matrix_command(&self, name: &str, max_rows: usize) -> String {
        render(self.matrix_template, name).replace("{rows}", &max_rows.to_string())
    }

    /// Command displaying the widget bound to `name`.
    pub fn widget_command(&self, name: &str) -> String {
        render(self.widget_template, name)
    }

    /// Command deleting `name`, then returning the variable list.
    pub fn delete_command(&self, name: &str) -> String {
        render(self.delete_template, name)
    }
}

/// Substitute `name` as a string literal.
///
/// A JSON string literal is also a valid Python and R string literal, so
/// the name cannot escape its argument position.
fn render(template: &str, name: &str) -> String {
    let literal = serde_json::Value::String(name.to_string()).to_string();
    template.replace("{name}", &literal)
}

static PYTHON: LanguageScripts = LanguageScripts {
    language: KernelLanguage::Python,
    init: include_str!("scripts/python.py"),
    query: "_varinspect_dict_list()",
    delete_all: "_varinspect_deleteallvariables()",
    matrix_template: "_varinspect_getmatrixcontent(_varinspect_lookup({name}), {rows})",
    widget_template: "_varinspect_displaywidget(_varinspect_lookup({name}))",
    delete_template: "_varinspect_deletevariable({name})",
};

static R: LanguageScripts = LanguageScripts {
    language: KernelLanguage::R,
    init: include_str!("scripts/r.R"),
    query: ".varinspect.listVariables()",
    delete_all: ".varinspect.deleteAllVariables()",
    matrix_template: ".varinspect.getMatrixContent(get({name}, envir = .GlobalEnv), {rows})",
    widget_template: "print(get({name}, envir = .GlobalEnv))",
    delete_template: ".varinspect.deleteVariable({name})",
};

/// Static lookup table from kernel language to script bundle.
pub struct ScriptRegistry;

impl ScriptRegistry {
    /// Find the bundle for `language`.
    ///
    /// Callers map `UnsupportedLanguage` to the no-op handler rather than
    /// treating it as a failure.
    pub fn lookup(language: &KernelLanguage) -> Result<&'static LanguageScripts, InspectError> {
        match language {
            KernelLanguage::Python => Ok(&PYTHON),
            KernelLanguage::R => Ok(&R),
            KernelLanguage::Other(_) => Err(InspectError::UnsupportedLanguage(language.clone())),
        }
    }

    /// Names of the languages with a bundle.
    pub fn languages() -> Vec<KernelLanguage> {
        vec![PYTHON.language.clone(), R.language.clone()]
    }
}
