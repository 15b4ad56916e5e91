//! SQL validation, rewriting and template substitution.

pub mod builder;
pub mod template;

pub use builder::{
    build_raw_query, ensure_timestamp_in_select, has_aggregate_projection, remove_limit,
    QueryMode,
};
pub use template::{extract_variable_names, substitute, TemplateVar, VarType};
