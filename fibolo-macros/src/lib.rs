#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Attribute macros setting up a fibolo runtime around a plain function.

mod entry;
mod parse;

/// Runs the function as the root fiber of a new runtime on the main thread.
///
/// The function is a regular, non-async `fn`: it runs on its own fiber stack
/// and may park with the blocking-looking calls of fibolo. Other fibers only
/// run while it is parked, and the process exits as soon as it returns.
///
/// # Options
///
/// - `stack_size = N`: stack of every fiber spawned with the default size,
///   the root fiber included.
/// - `poll_interval_ms = N`: longest time the scheduler blocks in epoll.
///
/// Function arguments are NOT allowed.
///
/// # Usage
///
/// ```no_run
/// #[fibolo::main]
/// fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// Equivalent code not using `#[fibolo::main]`
///
/// ```no_run
/// fn main() {
///     fibolo::runtime::Builder::new_local()
///         .try_build()
///         .expect("Failed building the Runtime")
///         .block_on(move || {
///             println!("Hello world");
///         })
/// }
/// ```
///
/// ## Bigger stacks
///
/// ```no_run
/// #[fibolo::main(stack_size = 1048576)]
/// fn main() {
///     println!("Hello world");
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Like [`macro@main`], for tests: every test gets the runtime of its own
/// test thread.
///
/// ```no_run
/// #[fibolo::test]
/// fn my_test() {
///     fibolo::time::sleep(std::time::Duration::from_millis(1)).unwrap();
/// }
/// ```
///
/// Equivalent code not using `#[fibolo::test]`
///
/// ```no_run
/// #[test]
/// fn my_test() {
///     fibolo::runtime::Builder::new_local()
///         .try_build()
///         .expect("Failed building the Runtime")
///         .block_on(move || {
///             fibolo::time::sleep(std::time::Duration::from_millis(1)).unwrap();
///         })
/// }
/// ```
///
/// Tests may return a `Result`, and combine with `rstest` when placed after
/// `#[rstest]`.
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
