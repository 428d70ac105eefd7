pub mod config;
pub mod executors;
pub mod job;
pub mod script;
pub mod search;
pub mod status;
pub mod status_file;
pub mod tasks;
pub mod template;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod status_file_test;
#[cfg(test)]
mod template_test;
