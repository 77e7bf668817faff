mod common;
mod listing_tests;
mod proxy_tests;
mod session_tests;
