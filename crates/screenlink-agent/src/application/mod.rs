//! Application layer: use cases with trait seams at every hardware edge,
//! so capture tests with a mock source instead of a real screen and input
//! routing tests with a recording sink instead of a real injector.

pub mod route_input;
pub mod stream_screen;
