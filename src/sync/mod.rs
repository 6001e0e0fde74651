pub mod display_guard;
