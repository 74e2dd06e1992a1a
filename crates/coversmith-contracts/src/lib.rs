pub mod outcome;
pub mod presets;
pub mod provenance;
pub mod request;
pub mod sanitize;
