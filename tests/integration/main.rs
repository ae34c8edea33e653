mod executor_tests;
mod workflow_tests;
