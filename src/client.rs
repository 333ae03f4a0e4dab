//! The client half of the replica-coordination core.
//!
//! A client broadcasts every request to every live replica and waits for one
//! acknowledgment per replica before its next broadcast, so the replica set
//! agrees on the request stream. Broadcasts are serialized by one mutex and
//! numbered from the client's Lamport clock, so `rseqno` is strictly
//! increasing per client. A background ticker broadcasts no-op dummy
//! requests so every replica's stability test always sees a recent head from
//! this client, and one receiver task per replica routes acknowledgments to
//! the broadcast coordinator and executed outputs back to the caller.

use crate::clock::LogicalClock;
use crate::wire::{Channel, Message, Transaction, WireError, WireResult};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Client tuning knobs.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Delay between dummy broadcasts. Shorter ticks lower execution latency
    /// at the cost of chatter; correctness does not depend on the value.
    pub dummy_tick_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            dummy_tick_interval: Duration::from_millis(100),
        }
    }
}

/// One replica as seen from the client: its channel, a live flag cleared at
/// most once, and the inbox the receiver task feeds with `k`/`f` messages.
/// The broadcast mutex guarantees at most one outstanding broadcast, so the
/// inbox never needs more than one slot.
struct ReplicaLink {
    chan: Arc<Channel>,
    live: AtomicBool,
    acks_tx: Sender<Message>,
    acks_rx: Receiver<Message>,
}

struct Shared {
    client_id: String,
    clock: LogicalClock,
    /// The broadcast sequencing restriction: broadcasts from one client are
    /// atomic with respect to each other.
    broadcast_lock: Mutex<()>,
    replicas: Vec<ReplicaLink>,
    quitting: AtomicBool,
}

/// A connected client. Dropping without [`ClientContext::quit`] severs the
/// connections abruptly, which replicas treat as an implicit quit.
pub struct ClientContext {
    shared: Arc<Shared>,
    outputs: Receiver<Message>,
    receivers: Vec<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl ClientContext {
    /// Connects and handshakes with every replica in order, then starts the
    /// receiver tasks and the dummy ticker. A replica that answers the
    /// handshake with a failure notice starts out demoted.
    pub fn connect<A: ToSocketAddrs>(
        replicas: &[A],
        config: ClientConfig,
    ) -> WireResult<ClientContext> {
        let client_id = generate_client_id();
        let clock = LogicalClock::new();

        let mut links = Vec::with_capacity(replicas.len());
        for addr in replicas {
            let chan = Arc::new(Channel::connect(addr)?);

            let mut init = Message::new(Transaction::Init);
            init.lclock = Some(clock.current());
            init.client_id = Some(client_id.clone());
            chan.send(&init)?;

            let reply = chan.recv()?;
            let live = match reply.transaction {
                Transaction::Init => true,
                Transaction::Failure => false,
                other => {
                    return Err(WireError::Malformed(format!(
                        "unexpected handshake reply: {other}"
                    )))
                }
            };
            if let Some(lclock) = reply.lclock {
                clock.observe(lclock);
            }
            log::info!(
                "Replica handshake complete. peer={}, live={}",
                chan.peer(),
                live
            );

            let (acks_tx, acks_rx) = bounded(1);
            links.push(ReplicaLink {
                chan,
                live: AtomicBool::new(live),
                acks_tx,
                acks_rx,
            });
        }

        let shared = Arc::new(Shared {
            client_id,
            clock,
            broadcast_lock: Mutex::new(()),
            replicas: links,
            quitting: AtomicBool::new(false),
        });

        let (output_tx, outputs) = unbounded();
        let receivers = (0..shared.replicas.len())
            .map(|index| {
                let shared = Arc::clone(&shared);
                let output_tx = output_tx.clone();
                thread::spawn(move || run_receiver(&shared, index, output_tx))
            })
            .collect();
        // The receiver tasks hold the only senders, so `request` can observe
        // total replica loss as a closed output queue.
        drop(output_tx);

        let ticker = {
            let shared = Arc::clone(&shared);
            let interval = config.dummy_tick_interval;
            Some(thread::spawn(move || run_ticker(&shared, interval)))
        };

        Ok(ClientContext {
            shared,
            outputs,
            receivers,
            ticker,
        })
    }

    /// The unique id this client broadcasts under.
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// How many replicas have not been demoted.
    pub fn live_replicas(&self) -> usize {
        self.shared
            .replicas
            .iter()
            .filter(|link| link.live.load(Ordering::SeqCst))
            .count()
    }

    pub fn replica_count(&self) -> usize {
        self.shared.replicas.len()
    }

    /// Broadcasts an application request and blocks until its output arrives
    /// from the fastest live replica. Returns `None` once every replica has
    /// failed: the broadcast then reaches nobody and no output is coming.
    pub fn request(&self, msg: Message) -> Option<String> {
        debug_assert!(msg.transaction.is_application());
        let rseqno = self.shared.broadcast(msg);
        loop {
            match self.outputs.recv() {
                // Smaller sequence numbers belong to broadcasts that already
                // resolved; later duplicates of this one are discarded the
                // same way by the next request.
                Ok(output) if output.rseqno == Some(rseqno) => return output.output_msg,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Broadcasts `q` to every replica, failed ones included so their drain
    /// loops can finish, then joins the background tasks and closes the
    /// channels.
    pub fn quit(mut self) {
        self.shared.broadcast(Message::new(Transaction::Quit));
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
        for receiver in self.receivers.drain(..) {
            let _ = receiver.join();
        }
        for link in &self.shared.replicas {
            link.chan.shutdown();
        }
        log::info!("Client quit. client={}", self.shared.client_id);
    }
}

impl Shared {
    /// One atomic broadcast: stamp a fresh `rseqno`, send to every live
    /// replica, then collect one acknowledgment per live replica, demoting
    /// any that answered with a failure notice. Returns the `rseqno`.
    fn broadcast(&self, mut msg: Message) -> u64 {
        let _guard = self.broadcast_lock.lock();

        let is_quit = msg.transaction == Transaction::Quit;
        if is_quit {
            self.quitting.store(true, Ordering::SeqCst);
        } else if self.quitting.load(Ordering::SeqCst) {
            // A dummy tick that lost the race with quit; nothing to say.
            return 0;
        }

        let rseqno = self.clock.tick();
        msg.rseqno = Some(rseqno);
        msg.client_id = Some(self.client_id.clone());

        for (index, link) in self.replicas.iter().enumerate() {
            if link.live.load(Ordering::SeqCst) || is_quit {
                if let Err(e) = link.chan.send(&msg) {
                    log::warn!("Send failed; demoting. replica={index}, err={e}");
                    link.live.store(false, Ordering::SeqCst);
                }
            }
        }

        if is_quit {
            // Fire-and-forget: the receiver tasks drain the final acks.
            return rseqno;
        }

        for (index, link) in self.replicas.iter().enumerate() {
            if !link.live.load(Ordering::SeqCst) {
                continue;
            }
            match link.acks_rx.recv() {
                Ok(ack) if ack.transaction == Transaction::Failure => {
                    log::debug!("Replica demoted by failure notice. replica={index}");
                    link.live.store(false, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(_) => link.live.store(false, Ordering::SeqCst),
            }
        }
        rseqno
    }
}

/// Consumes one replica's channel: acknowledgments and failure notices go to
/// the ack inbox, everything else is an executed output. Terminates on a
/// failure notice, on quit, or on a broken channel; a broken channel is
/// translated into a synthetic failure notice so a broadcast blocked on this
/// inbox demotes and moves on.
fn run_receiver(shared: &Shared, index: usize, output_tx: Sender<Message>) {
    let link = &shared.replicas[index];
    loop {
        let msg = match link.chan.recv() {
            Ok(msg) => msg,
            Err(e) => {
                if !shared.quitting.load(Ordering::SeqCst) {
                    log::warn!("Replica channel broke. replica={index}, err={e}");
                }
                let mut notice = Message::new(Transaction::Failure);
                notice.lclock = Some(shared.clock.current());
                // With the inbox already full nobody is awaiting this link,
                // and the next send will demote it instead.
                let _ = link.acks_tx.try_send(notice);
                return;
            }
        };
        if shared.quitting.load(Ordering::SeqCst) {
            return; // the final ack after q; nobody is waiting for it
        }
        if let Some(lclock) = msg.lclock {
            shared.clock.observe(lclock);
        }
        match msg.transaction {
            Transaction::Ack => {
                let _ = link.acks_tx.send(msg);
            }
            Transaction::Failure => {
                let _ = link.acks_tx.send(msg);
                return;
            }
            _ => {
                let _ = output_tx.send(msg);
            }
        }
    }
}

/// Broadcasts a dummy request every tick until the client quits. Dummies are
/// never awaited for output; they exist so every replica's stability test
/// always holds a recent sequence number from this client.
fn run_ticker(shared: &Shared, interval: Duration) {
    loop {
        if shared.quitting.load(Ordering::SeqCst) {
            return;
        }
        shared.broadcast(Message::new(Transaction::Dummy));
        thread::sleep(interval);
    }
}

/// A wall-clock timestamp plus a short entropy suffix. Unique per client
/// process, and free of the wire separator character.
fn generate_client_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}{:06}{:04x}",
        now.as_secs(),
        now.subsec_micros(),
        rand::random::<u16>()
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::replica::{Replica, ReplicaConfig};

    fn spawn_replica() -> Replica {
        Replica::spawn(ReplicaConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            test_log_dir: None,
        })
        .unwrap()
    }

    fn fast_config() -> ClientConfig {
        ClientConfig {
            dummy_tick_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn client_ids_are_unique() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_ne!(a, b);
        assert!(!a.contains('`'));
    }

    #[test]
    fn serves_requests_through_every_replica() {
        let replicas = [spawn_replica(), spawn_replica()];
        let addrs: Vec<_> = replicas.iter().map(|r| r.local_addr()).collect();
        let client = ClientContext::connect(&addrs, fast_config()).unwrap();
        assert_eq!(client.live_replicas(), 2);

        let listing = client.request(Message::list()).unwrap();
        assert_eq!(
            listing,
            "Availability,ZIP Code,Site Name\n0,02138,Harvard University"
        );
        client.quit();
    }

    #[test]
    fn demotes_a_replica_that_was_down_from_the_start() {
        let replicas = [spawn_replica(), spawn_replica()];
        replicas[0].inject_failure();
        let addrs: Vec<_> = replicas.iter().map(|r| r.local_addr()).collect();

        let client = ClientContext::connect(&addrs, fast_config()).unwrap();
        assert_eq!(client.live_replicas(), 1);

        let viewed = client.request(Message::view("Harvard University")).unwrap();
        assert_eq!(
            viewed,
            "Availability at Harvard University (ZIP code 02138): 0"
        );
        client.quit();
    }

    #[test]
    fn quit_drains_even_when_every_replica_has_failed() {
        let replica = spawn_replica();
        replica.inject_failure();
        let addrs = [replica.local_addr()];

        let client = ClientContext::connect(&addrs, fast_config()).unwrap();
        assert_eq!(client.live_replicas(), 0);
        // The failed replica still accepts q and answers with a final dummy
        // ack, so quitting completes instead of hanging.
        client.quit();
    }
}
