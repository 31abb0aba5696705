use std::{
    io::{self, BufRead},
    thread::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cancel `token` as soon as the operator enters a line on stdin
pub fn watch_stdin(token: CancellationToken) -> io::Result<JoinHandle<()>> {
    watch(io::BufReader::new(io::stdin()), token)
}

/// Cancel `token` once one line has been read from `reader`
///
/// End of input never cancels, so a run without a terminal attached keeps
/// going until every patient is done.
pub fn watch<R>(mut reader: R, token: CancellationToken) -> io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("key-capture".to_string())
        .spawn(move || {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => debug!("stdin closed, stop requests disabled"),
                Ok(_) => {
                    info!("Stop requested, finishing the current patient");
                    token.cancel();
                }
                Err(e) => warn!("Could not read stdin: {}", e),
            }
        })
}
