pub mod session_sm;
