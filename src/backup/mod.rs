pub mod backup_config;
pub mod borg;
pub mod hooks;
pub mod notifications;
pub mod orchestrator;
pub mod permissions;
pub mod process;
pub mod redacted;
pub mod result_error;
pub mod retention;
pub mod run_log;
pub mod services;
pub mod text;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
