mod config_tests;
mod security_tests;
