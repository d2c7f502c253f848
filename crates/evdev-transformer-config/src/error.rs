use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("failed to parse configuration JSON")]
    #[diagnostic(code(evdev_transformer::config::parse_error))]
    ParseError {
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {message}")]
    #[diagnostic(code(evdev_transformer::config::invalid))]
    Invalid { message: String },

    #[error("unsupported config_version {found}, expected {supported}")]
    #[diagnostic(code(evdev_transformer::config::unsupported_version))]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("duplicate {kind} name: {name}")]
    #[diagnostic(code(evdev_transformer::config::duplicate_name))]
    DuplicateName { kind: &'static str, name: String },

    #[error("unknown {kind} reference: {name}")]
    #[diagnostic(code(evdev_transformer::config::unknown_reference))]
    UnknownReference { kind: &'static str, name: String },

    #[error("source '{source}' belongs to more than one source_group")]
    #[diagnostic(code(evdev_transformer::config::overlapping_source_groups))]
    OverlappingSourceGroups { source: String },

    #[error("duplicate link for (source_group = {source_group}, destination = {destination})")]
    #[diagnostic(code(evdev_transformer::config::duplicate_link))]
    DuplicateLink {
        source_group: String,
        destination: String,
    },

    #[error("link for source_group '{source_group}' has two activators that match the same trigger")]
    #[diagnostic(code(evdev_transformer::config::duplicate_activator))]
    DuplicateActivator { source_group: String },

    #[error("unrecognized key name: {key}")]
    #[diagnostic(code(evdev_transformer::config::unknown_key))]
    UnknownKey { key: String },

    #[error("script-based {kind}s are not supported by this build; configure a key_remap/hotkey instead")]
    #[diagnostic(code(evdev_transformer::config::unsupported_script))]
    UnsupportedScript { kind: &'static str },

    #[error("missing required field: {field}")]
    #[diagnostic(code(evdev_transformer::config::missing_field))]
    MissingField { field: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
