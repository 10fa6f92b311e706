mod parser;
mod types;

pub use parser::{parse_definition_str, parse_definition_value};
pub use types::{
    Definition, FormatterSpec, IdStrategy, IndexSpec, ModelNames, PluginRef, VirtualSpec,
};
