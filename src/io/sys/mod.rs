cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod unix;
        pub use unix::*;
    } else {
        compile_error!("no polling backend for this platform");
    }
}
