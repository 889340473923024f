use std::{env, path::PathBuf, process::ExitCode};

use anyhow::Context as _;
use tfs_server::{Server, fifo};

fn main() -> ExitCode {
    env_logger::init();

    let mut args = env::args_os().skip(1);
    let (Some(path), None) = (args.next(), args.next()) else {
        eprintln!("Usage: tfs_server <rendezvous_path>");
        return ExitCode::FAILURE;
    };

    match serve(PathBuf::from(path)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[ERR]: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn serve(path: PathBuf) -> anyhow::Result<()> {
    fifo::ignore_sigpipe();
    let server = Server::new(path).context("server setup failed")?;
    log::info!("starting TecnicoFS server on {}", server.rendezvous().display());
    let result = server.run().context("serving failed");
    fifo::remove(server.rendezvous()).context("removing rendezvous channel failed")?;
    result
}
