mod harness;
mod refresh_tests;
mod session_tests;
mod sync_scenarios;
