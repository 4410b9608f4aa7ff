//! Pass a file around a ring of in-process ranks
//!
//! Every rank reads its own file and sends it to the next rank, while
//! writing whatever arrives from the previous one.

use flowgraph::prelude::*;
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

const RING: &str = "\
stage read-file reader
stage send-next sender
stage recv-prev receiver
stage write-file writer
connect reader.data_out sender.data_in
connect receiver.data_out writer.data_in
set_bufsize default 4096
";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let ranks = 4;
    let dir = tempfile::tempdir()?;
    for rank in 0..ranks {
        let text = format!("greetings from rank {}\n", rank).repeat(1000);
        std::fs::write(dir.path().join(format!("{}.txt", rank)), text)?;
    }

    let handles: Vec<_> = LocalCluster::new(ranks)
        .into_endpoints()
        .into_iter()
        .map(|ep| {
            let base = dir.path().to_path_buf();
            thread::spawn(move || -> Result<()> {
                let rank = ep.rank();
                let registry = Registry::with_transport(Arc::new(ep));
                let mut nw = config::load_str(&registry, &format!("ring-{}", rank), RING)?;
                nw.set_param("reader.filename", base.join(format!("{}.txt", rank)).display().to_string())?;
                nw.set_param("writer.filename", base.join(format!("{}.recv", rank)).display().to_string())?;
                nw.fix()?;
                nw.run()
            })
        })
        .collect();

    for handle in handles {
        if handle.join().is_err() {
            eprintln!("a rank panicked");
            std::process::exit(1);
        }
    }

    for rank in 0..ranks {
        let received = std::fs::read_to_string(dir.path().join(format!("{}.recv", rank)))?;
        let first = received.lines().next().unwrap_or("");
        println!("rank {} received {} bytes: {:?}...", rank, received.len(), first);
    }
    Ok(())
}
