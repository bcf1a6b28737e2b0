//! Byte signatures locating the client's static variables.
//!
//! Every signature matches an instruction whose 32-bit operand, two bytes in,
//! is the absolute address of the variable we want (`deref_at(match, 2)`).

use serde::Deserialize;

use crate::memory::Signature;
use crate::Result;

/// Compare against the glue screen state.
pub const GLUE_STATE: &str = "83 3d ?? ?? ?? ?? ?? 75 ?? e8 ?? ?? ?? ?? 8b 10 8b c8 ff 62 5c c3";

/// Compare against the in-world flag.
pub const GAME_STATE: &str = "80 3d ?? ?? ?? ?? ?? 74 ?? 50 b9 ?? ?? ?? ?? e8 ?? ?? ?? ?? \
                              85 c0 74 ?? 8b 40 08 83 f8 02 74 ?? 83 f8 01 75 ?? b0 01 c3 32 c0 c3";

/// `EditBox:HasFocus` comparing against the focused widget pointer.
pub const FOCUSED_WIDGET: &str =
    "3b 05 ?? ?? ?? ?? 0f 94 c1 51 ff 75 08 e8 ?? ?? ?? ?? 33 c0 83 c4 10 40 5d c3";

/// Script buffer execution loading the interpreter state pointer.
pub const INTERPRETER_STATE: &str = "8b 35 ?? ?? ?? ?? 33 db 57 3b c3 74 ?? 88 18 ff 75 08 \
                                     8d 85 dc fe ff ff 68 ?? ?? ?? ?? 68 ?? ?? ?? ?? 50";

/// First counter incremented when the loading screen is enabled.
pub const LOADING_SCREEN: &str = "ff 05 ?? ?? ?? ?? 83 3d ?? ?? ?? ?? ?? 53 56 57 0f 8f ?? ?? ?? ?? \
                                  6a 00 e8 ?? ?? ?? ?? 59 e8 ?? ?? ?? ?? 84 c0 74 ?? 6a 00 68";

/// Offset of the address operand inside each matched instruction.
pub const OPERAND_OFFSET: u64 = 2;

/// Signature text as written in configuration; unset entries use the
/// shipped defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Interpreter state pointer.
    pub interpreter_state: String,
    /// In-world flag.
    pub game_state: String,
    /// Focused widget pointer.
    pub focused_widget: String,
    /// Loading screen counter.
    pub loading_screen: String,
    /// Glue screen state.
    pub glue_state: String,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            interpreter_state: INTERPRETER_STATE.to_owned(),
            game_state: GAME_STATE.to_owned(),
            focused_widget: FOCUSED_WIDGET.to_owned(),
            loading_screen: LOADING_SCREEN.to_owned(),
            glue_state: GLUE_STATE.to_owned(),
        }
    }
}

impl SignatureConfig {
    /// Parse every signature.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`](crate::AppError::Config) naming the first bad entry.
    pub fn compile(&self) -> Result<SignatureSet> {
        let parse = |name: &str, text: &str| {
            Signature::parse(text).map_err(|err| {
                crate::AppError::Config(format!("signature {name}: {err}"))
            })
        };
        Ok(SignatureSet {
            interpreter_state: parse("interpreter_state", &self.interpreter_state)?,
            game_state: parse("game_state", &self.game_state)?,
            focused_widget: parse("focused_widget", &self.focused_widget)?,
            loading_screen: parse("loading_screen", &self.loading_screen)?,
            glue_state: parse("glue_state", &self.glue_state)?,
        })
    }
}

/// Parsed signatures for one client build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSet {
    /// Interpreter state pointer.
    pub interpreter_state: Signature,
    /// In-world flag.
    pub game_state: Signature,
    /// Focused widget pointer.
    pub focused_widget: Signature,
    /// Loading screen counter.
    pub loading_screen: Signature,
    /// Glue screen state.
    pub glue_state: Signature,
}

impl SignatureSet {
    /// The signatures shipped for the supported client build.
    ///
    /// # Errors
    ///
    /// Never in practice; the built-in text is valid.
    pub fn builtin() -> Result<Self> {
        SignatureConfig::default().compile()
    }
}
