pub mod common;

mod budget_concurrency_test;
mod config_reload_test;
mod policy_engine_test;
