//! A server replica: one copy of the replicated state machine.
//!
//! Each replica accepts any number of client connections, keeps one FIFO of
//! pending requests per connected client, and runs a single execution task
//! that repeatedly executes the *stable* request: the minimum
//! `(rseqno, client_id)` among the heads of all per-client queues. Because
//! every client broadcasts with strictly increasing `rseqno` and keeps a
//! dummy request flowing, the minimum head can never be preceded by a future
//! request, so every live replica executes the same non-dummy sequence.
//!
//! A simulated failure flips the replica's live flag: the execution task
//! halts, and each connection handler sends one failure notice, then drains
//! its channel until the client's quit arrives.

use crate::app::SiteDb;
use crate::clock::LogicalClock;
use crate::wire::{Channel, Message, Transaction, WireError, WireResult};
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write as _;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Startup parameters for one replica.
#[derive(Clone, Debug)]
pub struct ReplicaConfig {
    pub bind_addr: SocketAddr,
    /// When set, every executed request is appended to
    /// `test_log_<port>.txt` in this directory as `<rseqno>: <output>`.
    pub test_log_dir: Option<PathBuf>,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], crate::BASE_PORT)),
            test_log_dir: None,
        }
    }
}

/// The per-client request FIFO. The sender side belongs to that client's
/// connection handler; the execution task clones the receiver as needed.
struct ClientQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

/// Queue registry and connection membership, guarded by one lock. The lock
/// is never held across a blocking queue read or any channel I/O.
#[derive(Default)]
struct Registry {
    queues: HashMap<String, ClientQueue>,
    connected: HashSet<String>,
}

struct Shared {
    alive: AtomicBool,
    clock: LogicalClock,
    registry: Mutex<Registry>,
    /// Signalled when the connected set becomes non-empty (and on failure
    /// injection, so an idle execution task can halt).
    not_idle: Condvar,
    /// Outbound channels, readable from both the handlers and the execution
    /// task.
    sockets: DashMap<String, Arc<Channel>>,
    test_log: Option<Mutex<File>>,
    port: u16,
}

/// Handle to a running replica. All work happens on background tasks; the
/// handle only exposes identity and the failure injector.
pub struct Replica {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl Replica {
    /// Binds the listener and spawns the accept and execution tasks.
    pub fn spawn(config: ReplicaConfig) -> std::io::Result<Replica> {
        let listener = TcpListener::bind(config.bind_addr)?;
        let local_addr = listener.local_addr()?;

        let test_log = match &config.test_log_dir {
            Some(dir) => {
                let path = dir.join(format!("test_log_{}.txt", local_addr.port()));
                Some(Mutex::new(File::create(path)?))
            }
            None => None,
        };

        let shared = Arc::new(Shared {
            alive: AtomicBool::new(true),
            clock: LogicalClock::new(),
            registry: Mutex::new(Registry::default()),
            not_idle: Condvar::new(),
            sockets: DashMap::new(),
            test_log,
            port: local_addr.port(),
        });

        {
            let shared = Arc::clone(&shared);
            thread::spawn(move || run_acceptor(shared, listener));
        }
        {
            let shared = Arc::clone(&shared);
            thread::spawn(move || run_executor(shared));
        }

        log::info!("Replica listening. addr={local_addr}");
        Ok(Replica { shared, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Simulates a crash: the execution task halts and every connection
    /// handler emits a failure notice, then serves only the quit drain. The
    /// flag transitions at most once; the process stays up.
    pub fn inject_failure(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        let _registry = self.shared.registry.lock();
        self.shared.not_idle.notify_all();
        log::info!("Simulated failure injected. replica={}", self.shared.port);
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }
}

fn run_acceptor(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!("Connection accepted. replica={}, peer={}", shared.port, peer);
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    if let Err(e) = run_connection(&shared, stream) {
                        log::warn!("Connection ended. replica={}, err={}", shared.port, e);
                    }
                });
            }
            Err(e) => {
                log::warn!("Unable to accept. Ignoring. replica={}, err={}", shared.port, e);
            }
        }
    }
}

/// Serves one client connection: handshake, then receive → enqueue → ack
/// until quit or failure.
fn run_connection(shared: &Arc<Shared>, stream: TcpStream) -> WireResult<()> {
    let chan = Arc::new(Channel::new(stream)?);

    let init = chan.recv()?;
    if init.transaction != Transaction::Init {
        return Err(WireError::Malformed(format!(
            "expected init handshake, got {}",
            init.transaction
        )));
    }
    let client_id = init
        .client_id
        .clone()
        .ok_or_else(|| WireError::Malformed("init without client_id".to_owned()))?;

    // Register before replying so the execution task sees the client as soon
    // as it is acknowledged.
    let queue_tx = {
        let mut registry = shared.registry.lock();
        let (tx, rx) = unbounded();
        registry.queues.insert(
            client_id.clone(),
            ClientQueue { tx: tx.clone(), rx },
        );
        registry.connected.insert(client_id.clone());
        shared.not_idle.notify_all();
        tx
    };

    shared.clock.observe(init.lclock.unwrap_or(0));
    let lclock = shared.clock.tick();

    // A failed replica withholds the init ack; the failure path below sends
    // the notice the client will read instead.
    if shared.alive.load(Ordering::SeqCst) {
        let mut ack = Message::new(Transaction::Init);
        ack.lclock = Some(lclock);
        if let Err(e) = chan.send(&ack) {
            enqueue_implicit_quit(shared, &queue_tx, &client_id);
            return Err(e);
        }
    }
    shared.sockets.insert(client_id.clone(), Arc::clone(&chan));
    log::info!("Client connected. replica={}, client={}", shared.port, client_id);

    while shared.alive.load(Ordering::SeqCst) {
        let mut request = match chan.recv() {
            Ok(request) => request,
            Err(e) => {
                log::warn!(
                    "Client channel broke; treating as quit. replica={}, client={}, err={}",
                    shared.port,
                    client_id,
                    e
                );
                enqueue_implicit_quit(shared, &queue_tx, &client_id);
                return Ok(());
            }
        };
        let rseqno = match request.rseqno {
            Some(rseqno) => rseqno,
            None => {
                log::warn!(
                    "Request without rseqno; closing connection. replica={}, client={}",
                    shared.port,
                    client_id
                );
                enqueue_implicit_quit(shared, &queue_tx, &client_id);
                return Ok(());
            }
        };

        // Annotate with this replica's clock after folding in the request's
        // sequence number, then enqueue for the execution task.
        request.lclock = Some(shared.clock.observe(rseqno));
        let action = request.transaction;
        let _ = queue_tx.send(request);

        let mut ack = Message::new(Transaction::Ack);
        ack.rseqno = Some(rseqno);
        ack.lclock = Some(shared.clock.tick());
        if let Err(e) = chan.send(&ack) {
            log::warn!(
                "Unable to ack; treating as quit. replica={}, client={}, err={}",
                shared.port,
                client_id,
                e
            );
            if action != Transaction::Quit {
                enqueue_implicit_quit(shared, &queue_tx, &client_id);
            } else {
                shared.registry.lock().connected.remove(&client_id);
            }
            return Ok(());
        }

        if action == Transaction::Quit {
            break;
        }
    }

    if !shared.alive.load(Ordering::SeqCst) {
        // Simulated failure: notify, then keep draining so the client's quit
        // can complete. One final dummy ack unblocks a receiver task still
        // reading this channel.
        let mut notice = Message::new(Transaction::Failure);
        notice.lclock = Some(shared.clock.current());
        let _ = chan.send(&notice);
        log::info!(
            "Failure notice sent. replica={}, client={}",
            shared.port,
            client_id
        );
        loop {
            match chan.recv() {
                Ok(msg) if msg.transaction == Transaction::Quit => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        let mut bye = Message::new(Transaction::Dummy);
        bye.lclock = Some(shared.clock.current());
        let _ = chan.send(&bye);
        chan.shutdown();
        shared.sockets.remove(&client_id);
        let mut registry = shared.registry.lock();
        registry.connected.remove(&client_id);
    } else {
        // Clean quit: the execution task tears the queue down once it drains
        // the q, but the client stops counting toward stability immediately.
        shared.registry.lock().connected.remove(&client_id);
    }
    Ok(())
}

/// A broken or protocol-violating connection counts as a quit so the
/// execution task can tear the client down.
fn enqueue_implicit_quit(shared: &Shared, queue_tx: &Sender<Message>, client_id: &str) {
    let mut quit = Message::new(Transaction::Quit);
    quit.rseqno = Some(shared.clock.tick());
    quit.client_id = Some(client_id.to_owned());
    let _ = queue_tx.send(quit);
    shared.registry.lock().connected.remove(client_id);
}

/// The execution task: repeatedly executes the stable request.
fn run_executor(shared: Arc<Shared>) {
    let mut db = SiteDb::new();
    // One head per client, keyed by client id; the candidate set for the
    // stability test.
    let mut heads: HashMap<String, Message> = HashMap::new();

    loop {
        if !shared.alive.load(Ordering::SeqCst) {
            log::info!("Execution halted by simulated failure. replica={}", shared.port);
            return;
        }

        // Park while no clients are connected.
        {
            let mut registry = shared.registry.lock();
            while registry.connected.is_empty() {
                if !shared.alive.load(Ordering::SeqCst) {
                    return;
                }
                shared.not_idle.wait(&mut registry);
            }
        }

        // Fill: ensure one head per registered client. The registry lock is
        // released before the blocking reads.
        let missing: Vec<(String, Receiver<Message>)> = {
            let registry = shared.registry.lock();
            registry
                .queues
                .iter()
                .filter(|(id, _)| !heads.contains_key(*id))
                .map(|(id, queue)| (id.clone(), queue.rx.clone()))
                .collect()
        };
        for (id, rx) in missing {
            if let Ok(request) = rx.recv() {
                heads.insert(id, request);
            }
        }

        // Stability test: the minimum (rseqno, client_id) head cannot be
        // preceded by any future request.
        let picked_id = match heads
            .iter()
            .min_by(|(id_a, head_a), (id_b, head_b)| {
                (head_a.rseqno.unwrap_or(0), id_a.as_str())
                    .cmp(&(head_b.rseqno.unwrap_or(0), id_b.as_str()))
            })
            .map(|(id, _)| id.clone())
        {
            Some(id) => id,
            None => continue,
        };
        let Some(request) = heads.remove(&picked_id) else {
            continue;
        };

        if request.transaction == Transaction::Quit {
            {
                let mut registry = shared.registry.lock();
                registry.queues.remove(&picked_id);
                registry.connected.remove(&picked_id);
            }
            if let Some((_, chan)) = shared.sockets.remove(&picked_id) {
                chan.shutdown();
            }
            log::info!("Client departed. replica={}, client={}", shared.port, picked_id);
            continue;
        }

        // Replace the picked head before the execute/skip decision. For a
        // non-dummy request this wait doubles as the agreement check: the
        // client's next broadcast (a dummy at the latest) proves every live
        // replica acknowledged this one.
        let next_rx = {
            let registry = shared.registry.lock();
            registry.queues.get(&picked_id).map(|queue| queue.rx.clone())
        };
        if let Some(rx) = next_rx {
            if let Ok(next) = rx.recv() {
                heads.insert(picked_id.clone(), next);
            }
        }

        // Dummies keep the clock moving but carry no work, and a request from
        // a client that already quit has nowhere to send its output.
        let connected = shared.registry.lock().connected.contains(&picked_id);
        if request.transaction == Transaction::Dummy || !connected {
            continue;
        }
        if !shared.alive.load(Ordering::SeqCst) {
            return;
        }

        // Execute and reply to the requesting client.
        let rseqno = request.rseqno.unwrap_or(0);
        let lclock = shared.clock.tick();
        let output = db.apply(&request);

        let mut reply = Message::new(request.transaction);
        reply.rseqno = Some(rseqno);
        reply.lclock = Some(lclock);
        reply.output_msg = Some(output.clone());
        if let Some(chan) = shared.sockets.get(&picked_id) {
            if let Err(e) = chan.send(&reply) {
                log::warn!(
                    "Unable to deliver output. replica={}, client={}, err={}",
                    shared.port,
                    picked_id,
                    e
                );
            }
        }
        log::debug!(
            "Executed. replica={}, client={}, transaction={}, rseqno={}",
            shared.port,
            picked_id,
            request.transaction,
            rseqno
        );

        if let Some(test_log) = &shared.test_log {
            let mut file = test_log.lock();
            let _ = writeln!(file, "{rseqno}: {output}");
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::{Channel, Message, Transaction, WireError};

    fn spawn_replica() -> Replica {
        Replica::spawn(ReplicaConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            test_log_dir: None,
        })
        .unwrap()
    }

    fn handshake(replica: &Replica, client_id: &str) -> Channel {
        let chan = Channel::connect(replica.local_addr()).unwrap();
        let mut init = Message::new(Transaction::Init);
        init.lclock = Some(0);
        init.client_id = Some(client_id.to_owned());
        chan.send(&init).unwrap();
        chan
    }

    fn request(transaction: Transaction, client_id: &str, rseqno: u64) -> Message {
        let mut msg = Message::new(transaction);
        msg.client_id = Some(client_id.to_owned());
        msg.rseqno = Some(rseqno);
        msg
    }

    #[test]
    fn acks_and_executes_for_a_single_client() {
        let replica = spawn_replica();
        let chan = handshake(&replica, "c1");

        let ack = chan.recv().unwrap();
        assert_eq!(ack.transaction, Transaction::Init);
        assert!(ack.lclock.unwrap() > 0);

        chan.send(&{
            let mut list = Message::list();
            list.client_id = Some("c1".to_owned());
            list.rseqno = Some(5);
            list
        })
        .unwrap();
        let ack = chan.recv().unwrap();
        assert_eq!(ack.transaction, Transaction::Ack);
        assert_eq!(ack.rseqno, Some(5));

        // The list request stays queued until the client's next broadcast
        // proves it stable; a dummy releases it. The dummy's ack and the list
        // output come from different tasks, so their order can vary.
        chan.send(&request(Transaction::Dummy, "c1", 6)).unwrap();
        let mut received = vec![chan.recv().unwrap(), chan.recv().unwrap()];
        received.sort_by_key(|m| m.rseqno);
        let output = &received[0];
        assert_eq!(output.transaction, Transaction::List);
        assert_eq!(output.rseqno, Some(5));
        assert_eq!(
            output.output_msg.as_deref(),
            Some("Availability,ZIP Code,Site Name\n0,02138,Harvard University")
        );
        assert_eq!(received[1].transaction, Transaction::Ack);
        assert_eq!(received[1].rseqno, Some(6));
    }

    #[test]
    fn executes_in_rseqno_order_across_clients() {
        let replica = spawn_replica();
        let a = handshake(&replica, "a");
        a.recv().unwrap();
        let b = handshake(&replica, "b");
        b.recv().unwrap();

        // A leading dummy from each client guarantees both contribute a head
        // to the stability test before the interesting requests arrive.
        a.send(&request(Transaction::Dummy, "a", 2)).unwrap();
        a.recv().unwrap();
        b.send(&request(Transaction::Dummy, "b", 3)).unwrap();
        b.recv().unwrap();

        // b's edit carries the lower rseqno, so it must execute before a's
        // view even though a's request arrives first.
        a.send(&{
            let mut view = Message::view("Harvard University");
            view.client_id = Some("a".to_owned());
            view.rseqno = Some(10);
            view
        })
        .unwrap();
        a.recv().unwrap();
        b.send(&{
            let mut edit = Message::edit("Harvard University", "7");
            edit.client_id = Some("b".to_owned());
            edit.rseqno = Some(4);
            edit
        })
        .unwrap();
        b.recv().unwrap();

        // Advance both clients past the pending requests.
        a.send(&request(Transaction::Dummy, "a", 11)).unwrap();
        a.recv().unwrap();
        b.send(&request(Transaction::Dummy, "b", 12)).unwrap();

        // b's dummy ack and the edit output race on the wire.
        let from_b = [b.recv().unwrap(), b.recv().unwrap()];
        let edited = from_b
            .iter()
            .find(|m| m.transaction == Transaction::Edit)
            .unwrap();
        assert_eq!(
            edited.output_msg.as_deref(),
            Some("Vaccine availability at Harvard University (ZIP code 02138) updated to 7.")
        );
        let viewed = a.recv().unwrap();
        assert_eq!(
            viewed.output_msg.as_deref(),
            Some("Availability at Harvard University (ZIP code 02138): 7")
        );
    }

    #[test]
    fn failed_replica_notifies_then_drains_until_quit() {
        let replica = spawn_replica();
        let chan = handshake(&replica, "c1");
        chan.recv().unwrap();

        replica.inject_failure();
        assert!(!replica.is_alive());

        // The handler is already blocked on the next receive, so it still
        // acks one request before noticing the failure.
        chan.send(&request(Transaction::Dummy, "c1", 1)).unwrap();
        assert_eq!(chan.recv().unwrap().transaction, Transaction::Ack);
        assert_eq!(chan.recv().unwrap().transaction, Transaction::Failure);

        // The drain accepts the quit and answers with one final dummy ack.
        chan.send(&request(Transaction::Quit, "c1", 2)).unwrap();
        assert_eq!(chan.recv().unwrap().transaction, Transaction::Dummy);
        assert!(matches!(chan.recv(), Err(WireError::Closed)));
    }

    #[test]
    fn init_against_a_failed_replica_yields_a_failure_notice() {
        let replica = spawn_replica();
        replica.inject_failure();

        let chan = handshake(&replica, "c1");
        assert_eq!(chan.recv().unwrap().transaction, Transaction::Failure);
    }
}
