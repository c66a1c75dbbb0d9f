use std::process::Output;

use error_chain::error_chain;

error_chain! {
    errors {
        /// A connection or peer sent something we didn't expect.
        Protocol(msg: String) {
            description("protocol error")
            display("protocol error: {}", msg)
        }
        /// A child process exited non-zero; the output is preserved so callers
        /// can forward it verbatim rather than losing stdout/stderr to `?`.
        ProcessError(output: Output) {
            description("process exited unsuccessfully")
            display("process exited with status {:?}", output.status.code())
        }
        /// Bad CLI flags or environment.
        Config(msg: String) {
            description("configuration error")
            display("configuration error: {}", msg)
        }
    }

    foreign_links {
        Io(::std::io::Error);
        Bincode(::bincode::Error);
        Json(::serde_json::Error);
    }
}

/// Shorthand used throughout the crate for boxed futures that can fail with
/// our `Error` type, mirroring the teacher's `SFuture` alias.
pub type SFuture<T> = ::std::pin::Pin<Box<dyn ::std::future::Future<Output = Result<T>> + Send>>;
