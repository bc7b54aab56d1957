//! Standalone file server: serves a directory over HTTP (or HTTPS when a
//! certificate is configured), with generated directory indexes.

use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;

use clap::Parser;

use plume::mime::add_content_types;
use plume::{FileContextHandler, Server, TlsSocketFactory};

#[derive(Parser, Debug)]
#[command(
    name = "plume-httpd",
    version,
    about = "Serve files from a directory over HTTP"
)]
struct Args {
    /// Directory to serve
    dir: PathBuf,

    /// Port to listen on
    #[arg(default_value_t = 80)]
    port: u16,

    /// PEM certificate chain file, enabling HTTPS
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key file
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    if let Err(e) = run(Args::parse()) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> plume::Result<()> {
    // seed content types from the system table and a local override
    for path in [PathBuf::from("/etc/mime.types"), args.dir.join(".mime.types")] {
        if let Ok(file) = File::open(&path) {
            add_content_types(file)?;
        }
    }

    let mut server = Server::new(args.port);
    if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        server.set_socket_factory(Box::new(TlsSocketFactory::from_pem_files(cert, key)?));
    }
    let host = match server.virtual_host_mut(None) {
        Some(host) => host,
        None => return Err(plume::Error::Protocol("no default host".to_string())),
    };
    host.set_allow_generated_index(true);
    host.add_context("/", Arc::new(FileContextHandler::new(&args.dir)?), &[])?;

    let handle = server.start()?;
    println!("plume-httpd is listening on port {}", handle.port());
    loop {
        thread::park();
    }
}
