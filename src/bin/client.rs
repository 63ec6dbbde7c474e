//! relay-fabric/src/bin/client.rs
//! Reference REPL client: a thin wire-protocol driver for exercising a running
//! proxy by hand. Kubernetes-backed service discovery and ping-jitter reporting are
//! left out; directory and service-registry integration are out of scope for this
//! binary.

use std::sync::Arc;

use clap::Parser;
use tokio::fs::File;
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::error;

use relay_fabric::codec::{self, Command, ROLE_RECEIVER, ROLE_SENDER};
use relay_fabric::error::{FabricError, Result};
use relay_fabric::transport;

#[derive(Parser, Debug)]
#[command(author, version, about = "Reference REPL client for the relay fabric")]
struct Opt {
    /// This client's id.
    #[arg(long)]
    client: String,

    /// Receiver client id, if this client is a sender.
    #[arg(long)]
    sendto: Option<String>,

    /// Sender client ids, if this client is a receiver. Repeat for multiple senders.
    #[arg(long)]
    recvfrom: Vec<String>,

    /// Relative priority among senders targeting the same receiver.
    #[arg(long, default_value_t = 0)]
    priority: i64,
}

struct AgentClient {
    client_id: String,
    role: &'static str,
    receiver_id: String,
    sender_ids: Vec<String>,
    priority: i64,
    prev_cluster_ip: String,
    curr_cluster_ip: String,
    conn: Option<Arc<Mutex<TcpStream>>>,
}

#[tokio::main]
async fn main() {
    relay_fabric::logging::init_logging("info");
    let opt = Opt::parse();

    if opt.sendto.is_some() && !opt.recvfrom.is_empty() {
        eprintln!("cannot be sender and receiver at the same time");
        std::process::exit(1);
    }

    let (role, receiver_id, sender_ids) = if let Some(to) = opt.sendto {
        (ROLE_SENDER, to, Vec::new())
    } else if !opt.recvfrom.is_empty() {
        (ROLE_RECEIVER, String::new(), opt.recvfrom)
    } else {
        eprintln!("one of --sendto or --recvfrom is required");
        std::process::exit(1);
    };

    let mut cli = AgentClient {
        client_id: opt.client,
        role,
        receiver_id,
        sender_ids,
        priority: opt.priority,
        prev_cluster_ip: String::new(),
        curr_cluster_ip: String::new(),
        conn: None,
    };

    repl(&mut cli).await;
}

async fn repl(cli: &mut AgentClient) {
    println!("Welcome to the relay fabric REPL! Type '.help' for available commands.");
    let mut lines = BufReader::new(io::stdin()).lines();

    loop {
        print!("> ");
        use std::io::Write;
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "failed to read stdin");
                break;
            }
        };

        let mut tokens = line.splitn(2, ' ');
        let cmd = tokens.next().unwrap_or("");
        let rest = tokens.next().unwrap_or("").trim();

        let result = match cmd {
            ".help" => {
                print_help(cli.role);
                Ok(())
            }
            ".exit" => {
                disconnect(cli).await;
                break;
            }
            ".connect" => connect(cli, rest).await,
            ".service" => ping_service(rest).await,
            ".send" => send_data(cli, rest).await,
            ".sendfile" => send_file(cli, rest).await,
            ".sendfileToNode" => send_file_to_node(cli, rest).await,
            ".fetch" => fetch_client_data(cli, rest).await,
            "" => Ok(()),
            other => {
                println!("Unknown command '{other}'. Type '.help' for available commands.");
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("error: {e}");
        }
    }
}

fn print_help(role: &str) {
    if role == ROLE_SENDER {
        println!(
            "Commands:\n  .help\n  .exit\n  .connect <host:port> [clusterIp]\n  .service <host:pingPort>\n  .send <data>\n  .sendfile <path>\n  .sendfileToNode <path>\n  .fetch <clientId> <clusterIp>"
        );
    } else {
        println!("Commands:\n  .help\n  .exit\n  .connect <host:port> [clusterIp]\n  .service <host:pingPort>");
    }
}

/// Pings a proxy's UDP ping port and reports round-trip time.
async fn ping_service(arg: &str) -> Result<()> {
    let target: std::net::SocketAddr = arg
        .parse()
        .map_err(|_| FabricError::protocol("usage: .service <host:pingPort>"))?;
    let rtt = transport::ping_rtt(target)
        .await
        .map_err(|source| FabricError::Dial { addr: target.to_string(), source })?;
    println!("rtt to {target}: {:.3}ms", rtt.as_secs_f64() * 1000.0);
    Ok(())
}

/// Dials `addr` and performs the handshake. `arg` is `host:port` optionally
/// followed by this client's current ClusterIp (defaults to `addr`'s host when omitted).
async fn connect(cli: &mut AgentClient, arg: &str) -> Result<()> {
    let mut parts = arg.split_whitespace();
    let addr = parts
        .next()
        .ok_or_else(|| FabricError::protocol("usage: .connect <host:port> [clusterIp]"))?;
    let cluster_ip = parts
        .next()
        .map(str::to_string)
        .unwrap_or_else(|| addr.split(':').next().unwrap_or(addr).to_string());

    println!("connecting to {addr}");
    let mut conn = TcpStream::connect(addr)
        .await
        .map_err(|source| FabricError::Dial { addr: addr.to_string(), source })?;

    if cli.conn.is_some() {
        disconnect(cli).await;
    }

    cli.prev_cluster_ip = std::mem::replace(&mut cli.curr_cluster_ip, cluster_ip);

    codec::send(&mut conn, Command::ClientId, &cli.client_id).await?;
    codec::send(&mut conn, Command::ClientType, cli.role).await?;
    codec::send(&mut conn, Command::ClientPriority, &cli.priority.to_string()).await?;
    codec::send(&mut conn, Command::ClusterIp, &cli.curr_cluster_ip).await?;
    codec::send(&mut conn, Command::ClusterIp, &cli.prev_cluster_ip).await?;

    let (cmd, _) = codec::recv(&mut conn).await?;
    if cmd != Command::TransferFinished {
        return Err(FabricError::protocol("expected TransferFinished after handshake"));
    }
    println!("handshake complete, server has fetched old data");

    if cli.role == ROLE_SENDER {
        codec::send(&mut conn, Command::ClientId, &cli.receiver_id).await?;
        cli.conn = Some(Arc::new(Mutex::new(conn)));
    } else {
        codec::send(&mut conn, Command::RecvfromNum, &cli.sender_ids.len().to_string()).await?;
        for sender_id in &cli.sender_ids {
            codec::send(&mut conn, Command::ClientId, sender_id).await?;
        }
        let expected = cli.sender_ids.len();
        tokio::spawn(receive_loop(conn, expected));
    }

    Ok(())
}

/// Drives a receiver's connection to completion, printing each record as it arrives.
/// Ends once every sender has reported `TransferEnd`.
async fn receive_loop(mut conn: TcpStream, expected_senders: usize) {
    println!("receiving data:");
    let mut ended = 0usize;
    loop {
        let (cmd, payload) = match codec::recv(&mut conn).await {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "receive loop ended with an error");
                return;
            }
        };
        match cmd {
            Command::ClientData => println!("data: {payload}"),
            Command::TransferEnd => {
                ended += 1;
                println!("received all data from: {payload}");
                if ended >= expected_senders {
                    println!("receiving data ends");
                    return;
                }
            }
            other => {
                error!(?other, "unexpected frame on receiver connection");
                return;
            }
        }
    }
}

async fn send_data(cli: &mut AgentClient, data: &str) -> Result<()> {
    let conn = match &cli.conn {
        Some(conn) => conn,
        None => return Err(FabricError::protocol("not connected, run .connect first")),
    };
    codec::send(&mut *conn.lock().await, Command::ClientData, data).await
}

async fn send_file(cli: &mut AgentClient, path: &str) -> Result<()> {
    let conn = match &cli.conn {
        Some(conn) => conn.clone(),
        None => return Err(FabricError::protocol("not connected, run .connect first")),
    };
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    while let Some(line) = lines.next_line().await? {
        codec::send(&mut *conn.lock().await, Command::ClientData, &line).await?;
    }
    Ok(())
}

async fn send_file_to_node(cli: &mut AgentClient, path: &str) -> Result<()> {
    let conn = match &cli.conn {
        Some(conn) => conn.clone(),
        None => return Err(FabricError::protocol("not connected, run .connect first")),
    };
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();

    codec::send(&mut *conn.lock().await, Command::CreateConnBetweenServerAndNode, "").await?;
    while let Some(line) = lines.next_line().await? {
        let mut guard = conn.lock().await;
        codec::send(&mut *guard, Command::ClientDataToLocal, &line).await?;
        codec::send(&mut *guard, Command::ClientId, &cli.client_id).await?;
    }
    codec::send(&mut *conn.lock().await, Command::DisconnBetweenServerAndNode, "").await?;
    Ok(())
}

async fn fetch_client_data(cli: &mut AgentClient, arg: &str) -> Result<()> {
    let conn = match &cli.conn {
        Some(conn) => conn.clone(),
        None => return Err(FabricError::protocol("not connected, run .connect first")),
    };
    let mut parts = arg.split_whitespace();
    let target = parts
        .next()
        .ok_or_else(|| FabricError::protocol("usage: .fetch <clientId> <clusterIp>"))?;
    let cluster_ip = parts
        .next()
        .ok_or_else(|| FabricError::protocol("usage: .fetch <clientId> <clusterIp>"))?;

    let mut guard = conn.lock().await;
    codec::send(&mut *guard, Command::FetchClientData, target).await?;
    codec::send(&mut *guard, Command::ClusterIp, cluster_ip).await?;

    let mut dataset = Vec::new();
    loop {
        let (cmd, payload) = codec::recv(&mut *guard).await?;
        match cmd {
            Command::TransferData => dataset.push(payload),
            Command::TransferEnd => break,
            other => return Err(FabricError::protocol(format!("unexpected frame {other:?} during fetch"))),
        }
    }
    drop(guard);

    println!("{target} data:");
    for record in dataset {
        println!("{record}");
    }
    Ok(())
}

async fn disconnect(cli: &mut AgentClient) {
    if let Some(conn) = cli.conn.take() {
        if cli.role == ROLE_SENDER {
            let mut guard = conn.lock().await;
            let _ = codec::send(&mut *guard, Command::ClientExit, "").await;
        }
    }
}
