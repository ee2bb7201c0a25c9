use {
    clap::Parser,
    log::{error, info},
    std::{
        path::{Path, PathBuf},
        sync::Arc,
    },
    stor9p::{
        backend::Srv,
        fs::FsSrv,
        io_err,
        srv::{Config, serve_with_config},
        *,
    },
    tokio::net::{TcpListener, UnixListener},
};

mod osfs;
mod utils;
use crate::{osfs::OsFs, utils::parse_proto};

async fn srv_async_tcp<S: Srv>(srv: Arc<S>, addr: &str, config: Config) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let srv = srv.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            if let Err(e) = serve_with_config(srv, readhalf, writehalf, config).await {
                error!("Error: {}: {:?}", e, e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!(
                "Warning: Failed to remove socket file {:?}: {}",
                self.path, e
            );
        }
    }
}

async fn srv_async_unix<S: Srv>(srv: Arc<S>, addr: impl AsRef<Path>, config: Config) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = result?;
                info!("accepted: {:?}", peer);

                let srv = srv.clone();
                tokio::spawn(async move {
                    let (readhalf, writehalf) = tokio::io::split(stream);
                    if let Err(e) = serve_with_config(srv, readhalf, writehalf, config).await {
                        error!("Error: {:?}", e);
                    }
                });
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break;
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Listen on `proto!addr!port` and serve every connection with `srv`.
async fn srv_async<S: Srv>(srv: S, addr: &str, config: Config) -> Result<()> {
    let (proto, host, port) = parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;
    let listen_addr = format!("{}:{}", host, port);
    let srv = Arc::new(srv);

    match proto {
        "tcp" => srv_async_tcp(srv, &listen_addr, config).await,
        "unix" => srv_async_unix(srv, &listen_addr, config).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Directory to export
    exportdir: PathBuf,

    /// Largest 9P message accepted, in bytes
    #[arg(long, default_value_t = Config::default().msize)]
    msize: u32,

    /// Requests handled concurrently per connection
    #[arg(long, default_value_t = Config::default().max_in_flight)]
    max_in_flight: usize,
}

async fn dirfs_main(
    Cli {
        address,
        exportdir,
        msize,
        max_in_flight,
    }: Cli,
) -> Result<i32> {
    osfs::check_root(&exportdir).await?;

    let config = Config {
        msize,
        max_in_flight,
    };

    println!("[*] Exporting {:?}", exportdir);
    println!("[*] Ready to accept clients: {}", address);
    srv_async(FsSrv::new(OsFs::new(exportdir)), &address, config)
        .await
        .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = dirfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use stor9p::frame::{read_frame, write_frame};

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["dirfs", "tcp!127.0.0.1!5640", "/srv/export"]);
        assert_eq!(cli.msize, Config::default().msize);
        assert_eq!(cli.max_in_flight, Config::default().max_in_flight);

        let cli = Cli::parse_from([
            "dirfs",
            "unix!/tmp/dirfs!0",
            "/srv/export",
            "--msize",
            "8216",
            "--max-in-flight",
            "4",
        ]);
        assert_eq!(cli.msize, 8216);
        assert_eq!(cli.max_in_flight, 4);
    }

    #[tokio::test]
    async fn rejects_unknown_protocols() {
        let srv = FsSrv::new(OsFs::new("/nonexistent"));
        let err = srv_async(srv, "udp!0.0.0.0!564", Config::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Protocol not supported");

        let srv = FsSrv::new(OsFs::new("/nonexistent"));
        assert!(srv_async(srv, "tcp", Config::default()).await.is_err());
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("motd"), b"welcome").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let srv = FsSrv::new(OsFs::new(dir.path()));
        let listen = format!("tcp!{}!{}", addr.ip(), addr.port());
        tokio::spawn(async move { srv_async(srv, &listen, Config::default()).await });

        let mut stream = loop {
            match tokio::net::TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };

        let requests = [
            FCall::TVersion {
                msize: 8192,
                version: P92000.to_owned(),
            },
            FCall::TAttach {
                fid: 0,
                afid: NOFID,
                uname: "glenda".to_owned(),
                aname: String::new(),
            },
            FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["motd".to_owned()],
            },
            FCall::TOpen {
                fid: 1,
                mode: om::READ,
            },
            FCall::TRead {
                fid: 1,
                offset: 0,
                count: 100,
            },
        ];

        let mut last = None;
        for (tag, body) in requests.into_iter().enumerate() {
            write_frame(&mut stream, &Msg { tag: tag as u16, body })
                .await
                .unwrap();
            let resp = read_frame(&mut stream, 8192).await.unwrap().unwrap();
            assert_eq!(resp.tag, tag as u16);
            last = Some(resp.body);
        }

        assert_eq!(
            last,
            Some(FCall::RRead {
                data: Data(b"welcome".to_vec())
            })
        );
    }
}
