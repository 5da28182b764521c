//! Stream sockets on top of the reactor: TCP over IPv4 and unix sockets,
//! both filesystem and abstract.

mod addr;

mod conn;
pub use conn::Conn;

mod connect;
pub use connect::{connect_tcp, connect_unix, connect_unix_abstract};

mod listener;
pub use listener::{Listener, listen_tcp, listen_unix, listen_unix_abstract};

mod serve;
pub use serve::{ErrorHook, Handler, ServeOptions, WorkerInitHook};
