//! End-to-end runs of a 3-replica cluster on localhost.

use std::net::SocketAddr;
use std::path::PathBuf;

use paxoslog::{
    ClientId, PaxosLogClient, PaxosLogError, PaxosLogReplica, PaxosMsg,
    ReplicaSnapshot, SeqNum,
};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

const WAIT: Duration = Duration::from_secs(20);

/// A running cluster; replica `i` listens on `base_port + i`. Roster slots
/// not launched are left for the test to impersonate.
struct Cluster {
    roster: Vec<SocketAddr>,
    handles: Vec<Option<JoinHandle<Result<(), PaxosLogError>>>>,
    snapshots: Vec<Option<watch::Receiver<ReplicaSnapshot>>>,
    tx_term: watch::Sender<bool>,
}

impl Cluster {
    async fn launch(
        base_port: u16,
        extra: &str,
    ) -> Result<Self, PaxosLogError> {
        Self::launch_some(base_port, extra, &[0, 1, 2]).await
    }

    async fn launch_some(
        base_port: u16,
        extra: &str,
        ids: &[u8],
    ) -> Result<Self, PaxosLogError> {
        let roster: Vec<SocketAddr> = (0..3)
            .map(|i| SocketAddr::from(([127, 0, 0, 1], base_port + i)))
            .collect();
        let config = format!(
            "hb_period_ms = 50\nretry_interval_ms = 100\n\
             backer_dir = '/tmp/test-paxoslog-cluster-{}'\n{}",
            base_port, extra
        );

        let (tx_term, rx_term) = watch::channel(false);
        let mut handles = vec![];
        let mut snapshots = vec![];
        for id in 0..3 {
            if !ids.contains(&id) {
                handles.push(None);
                snapshots.push(None);
                continue;
            }
            let mut replica = PaxosLogReplica::new_and_setup(
                id,
                roster.clone(),
                Some(config.as_str()),
            )
            .await?;
            snapshots.push(Some(replica.subscribe()));
            let rx_term = rx_term.clone();
            handles.push(Some(tokio::spawn(async move {
                replica.run(rx_term).await
            })));
        }

        Ok(Cluster {
            roster,
            handles,
            snapshots,
            tx_term,
        })
    }

    /// Waits until replica `id` publishes a snapshot satisfying `pred`.
    async fn wait_for(
        &mut self,
        id: usize,
        pred: impl FnMut(&ReplicaSnapshot) -> bool,
    ) -> Result<ReplicaSnapshot, PaxosLogError> {
        let rx_snapshot = self.snapshots[id]
            .as_mut()
            .ok_or_else(|| PaxosLogError::msg("replica not launched"))?;
        let snapshot = time::timeout(WAIT, rx_snapshot.wait_for(pred))
            .await
            .map_err(|e| PaxosLogError::msg(e.to_string()))?
            .map_err(|e| PaxosLogError::msg(e.to_string()))?
            .clone();
        Ok(snapshot)
    }

    /// Kills replica `id` by aborting its main loop task.
    fn crash(&mut self, id: usize) {
        if let Some(handle) = &self.handles[id] {
            handle.abort();
        }
    }

    async fn stop(self) -> Result<(), PaxosLogError> {
        self.tx_term.send(true)?;
        for handle in self.handles.into_iter().flatten() {
            match handle.await {
                Ok(result) => result?,
                Err(e) if e.is_cancelled() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

async fn start_client(
    id: ClientId,
    port: u16,
    roster: Vec<SocketAddr>,
    config: &str,
) -> Result<
    (
        JoinHandle<Result<(), PaxosLogError>>,
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<(SeqNum, String)>,
        watch::Sender<bool>,
    ),
    PaxosLogError,
> {
    let (mut client, tx_submit, rx_deliver) = PaxosLogClient::new_and_setup(
        id,
        SocketAddr::from(([127, 0, 0, 1], port)),
        roster,
        Some(config),
    )
    .await?;
    let (tx_term, rx_term) = watch::channel(false);
    let handle = tokio::spawn(async move { client.run(rx_term).await });
    Ok((handle, tx_submit, rx_deliver, tx_term))
}

async fn next_delivery(
    rx_deliver: &mut mpsc::UnboundedReceiver<(SeqNum, String)>,
) -> Result<(SeqNum, String), PaxosLogError> {
    time::timeout(WAIT, rx_deliver.recv())
        .await
        .map_err(|e| PaxosLogError::msg(e.to_string()))?
        .ok_or_else(|| PaxosLogError::msg("delivery channel closed"))
}

/// Accepts the next reply connection and decodes its first frame.
async fn accept_reply(
    listener: &TcpListener,
) -> Result<PaxosMsg, PaxosLogError> {
    let (conn, _) = time::timeout(WAIT, listener.accept())
        .await
        .map_err(|e| PaxosLogError::msg(e.to_string()))??;
    let mut lines = BufReader::new(conn).lines();
    let line = time::timeout(WAIT, lines.next_line())
        .await
        .map_err(|e| PaxosLogError::msg(e.to_string()))??
        .ok_or_else(|| PaxosLogError::msg("reply connection closed"))?;
    PaxosMsg::decode(&line)
}

async fn send_raw(to: SocketAddr, msg: &PaxosMsg) -> Result<(), PaxosLogError> {
    let mut conn = TcpStream::connect(to).await?;
    conn.write_all(format!("{}\n", msg).as_bytes()).await?;
    conn.flush().await?;
    Ok(())
}

fn values(snapshot: &ReplicaSnapshot) -> Vec<&str> {
    snapshot.chosen.iter().map(|(_, v)| v.as_str()).collect()
}

/// Durable log file of replica `id` in a cluster launched at `base_port`.
fn log_path(base_port: u16, id: u8) -> PathBuf {
    PathBuf::from(format!(
        "/tmp/test-paxoslog-cluster-{}/replica{}.log",
        base_port, id
    ))
}

/// Polls a durable log file until it holds at least `n` lines, then gives
/// a moment for any stray extra line to show up before returning them all.
async fn log_lines(
    path: PathBuf,
    n: usize,
) -> Result<Vec<String>, PaxosLogError> {
    time::timeout(WAIT, async {
        loop {
            let content = tokio::fs::read_to_string(&path).await?;
            if content.lines().count() >= n {
                break;
            }
            time::sleep(Duration::from_millis(50)).await;
        }
        Ok::<_, PaxosLogError>(())
    })
    .await
    .map_err(|e| PaxosLogError::msg(e.to_string()))??;
    time::sleep(Duration::from_millis(300)).await;
    let content = tokio::fs::read_to_string(&path).await?;
    Ok(content.lines().map(String::from).collect())
}

/// Stands in for a silent replica: accepts every connection made to `addr`
/// and forwards whatever frames arrive, never answering.
async fn silent_replica(
    addr: SocketAddr,
) -> Result<mpsc::UnboundedReceiver<PaxosMsg>, PaxosLogError> {
    let listener = TcpListener::bind(addr).await?;
    let (tx_recv, rx_recv) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((conn, _)) = listener.accept().await {
            let tx_recv = tx_recv.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(conn).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(msg) = PaxosMsg::decode(&line) {
                        if tx_recv.send(msg).is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });
    Ok(rx_recv)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chat_reaches_every_replica() -> Result<(), PaxosLogError> {
    let mut cluster = Cluster::launch(53811, "").await?;
    let (handle, tx_submit, mut rx_deliver, _tx_term) = start_client(
        101,
        53814,
        cluster.roster.clone(),
        "hello_timeout_ms = 100",
    )
    .await?;

    tx_submit.send("Hi".into())?;
    assert_eq!(next_delivery(&mut rx_deliver).await?, (0, "Hi".to_string()));

    for id in 0..3 {
        let snapshot = cluster.wait_for(id, |s| !s.chosen.is_empty()).await?;
        assert_eq!(snapshot.chosen, vec![(0, "Hi".to_string())]);
    }

    drop(tx_submit);
    handle.await??;
    cluster.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hello_redirected_to_leader() -> Result<(), PaxosLogError> {
    let mut cluster = Cluster::launch(53821, "").await?;
    let leader = cluster.wait_for(0, |s| s.is_leader).await?;
    let leader_id = (leader.view % 3) as u8;
    let follower = (leader_id as usize + 1) % 3;
    cluster.wait_for(follower, |s| s.view == leader.view).await?;

    let listener = TcpListener::bind("127.0.0.1:53824").await?;
    let hello = PaxosMsg::Hello {
        client: 202,
        addr: listener.local_addr()?,
    };

    send_raw(cluster.roster[follower], &hello).await?;
    assert_eq!(
        accept_reply(&listener).await?,
        PaxosMsg::Nack { leader: leader_id }
    );

    send_raw(cluster.roster[leader_id as usize], &hello).await?;
    assert_eq!(accept_reply(&listener).await?, PaxosMsg::Ack);

    cluster.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lossy_network_chosen_once() -> Result<(), PaxosLogError> {
    let mut cluster = Cluster::launch(53831, "msg_loss_rate = 0.3").await?;
    let (handle, tx_submit, mut rx_deliver, _tx_term) = start_client(
        303,
        53834,
        cluster.roster.clone(),
        "hello_timeout_ms = 100\nmsg_loss_rate = 0.3",
    )
    .await?;

    let payloads: Vec<String> = (0..5).map(|i| format!("m{}", i)).collect();
    for payload in &payloads {
        tx_submit.send(payload.clone())?;
    }
    for (seq, payload) in payloads.iter().enumerate() {
        assert_eq!(
            next_delivery(&mut rx_deliver).await?,
            (seq as SeqNum, payload.clone())
        );
    }
    drop(tx_submit);
    handle.await??;

    // the leader committed each chat exactly once, in submission order
    let snapshot = cluster.wait_for(0, |s| s.chosen.len() >= 5).await?;
    assert!(snapshot.is_leader);
    assert_eq!(values(&snapshot), vec!["m0", "m1", "m2", "m3", "m4"]);
    assert_eq!(snapshot.first_unchosen, 5);

    cluster.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_failover() -> Result<(), PaxosLogError> {
    let mut cluster = Cluster::launch(53841, "").await?;
    let (handle, tx_submit, mut rx_deliver, _tx_term) = start_client(
        404,
        53844,
        cluster.roster.clone(),
        "hello_timeout_ms = 100",
    )
    .await?;

    tx_submit.send("before".into())?;
    assert_eq!(
        next_delivery(&mut rx_deliver).await?,
        (0, "before".to_string())
    );
    for id in 1..3 {
        cluster.wait_for(id, |s| s.chosen.len() == 1).await?;
    }

    // replica 0 leads view 0; after it dies replica 1 takes over view 1
    cluster.crash(0);
    let promoted = cluster.wait_for(1, |s| s.is_leader).await?;
    assert_eq!(promoted.view % 3, 1);

    tx_submit.send("after".into())?;
    assert_eq!(
        next_delivery(&mut rx_deliver).await?,
        (1, "after".to_string())
    );
    for id in 1..3 {
        let snapshot = cluster.wait_for(id, |s| s.chosen.len() >= 2).await?;
        assert_eq!(values(&snapshot), vec!["before", "after"]);
    }

    drop(tx_submit);
    handle.await??;
    cluster.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failover_after_minority_accept() -> Result<(), PaxosLogError> {
    // replica 0 led view 0 and got "Hi" accepted by replica 2 only before
    // going silent; the test plays its part
    let mut cluster = Cluster::launch_some(53851, "", &[1, 2]).await?;
    let mut rx_old_leader = silent_replica(cluster.roster[0]).await?;
    send_raw(
        cluster.roster[2],
        &PaxosMsg::Accept {
            round: 257,
            slot: 0,
            first_unchosen: 0,
            client: 7,
            seq: 0,
            value: "Hi".into(),
        },
    )
    .await?;
    time::timeout(WAIT, async {
        while let Some(msg) = rx_old_leader.recv().await {
            if matches!(msg, PaxosMsg::AcceptReply { from: 2, .. }) {
                return Ok(msg);
            }
        }
        Err(PaxosLogError::msg("old leader stand-in stopped"))
    })
    .await
    .map_err(|e| PaxosLogError::msg(e.to_string()))??;

    // the client retransmits the same request to whoever leads next
    let (handle, tx_submit, mut rx_deliver, _tx_term) = start_client(
        7,
        53854,
        cluster.roster.clone(),
        "hello_timeout_ms = 100",
    )
    .await?;
    tx_submit.send("Hi".into())?;
    tx_submit.send("bye".into())?;
    assert_eq!(next_delivery(&mut rx_deliver).await?, (0, "Hi".to_string()));
    assert_eq!(
        next_delivery(&mut rx_deliver).await?,
        (1, "bye".to_string())
    );
    drop(tx_submit);
    handle.await??;

    // "Hi" was chosen exactly once, in the slot where it was first accepted
    let snapshot = cluster.wait_for(1, |s| s.chosen.len() >= 2).await?;
    assert!(snapshot.is_leader);
    assert_eq!(
        snapshot.chosen,
        vec![(0, "Hi".to_string()), (1, "bye".to_string())]
    );
    let snapshot = cluster.wait_for(2, |s| s.chosen.len() >= 2).await?;
    assert_eq!(values(&snapshot), vec!["Hi", "bye"]);

    cluster.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn durable_log_holds_each_chat_once() -> Result<(), PaxosLogError> {
    let cluster = Cluster::launch(53861, "").await?;
    let (handle, tx_submit, mut rx_deliver, _tx_term) = start_client(
        606,
        53864,
        cluster.roster.clone(),
        "hello_timeout_ms = 100",
    )
    .await?;

    let payloads: Vec<String> = ["first", "second: with colon", "last"]
        .iter()
        .map(|p| p.to_string())
        .collect();
    for payload in &payloads {
        tx_submit.send(payload.clone())?;
    }
    for (seq, payload) in payloads.iter().enumerate() {
        assert_eq!(
            next_delivery(&mut rx_deliver).await?,
            (seq as SeqNum, payload.clone())
        );
    }
    drop(tx_submit);
    handle.await??;

    // every replica's log file is the chosen sequence, one line per slot
    for id in 0..3 {
        let lines = log_lines(log_path(53861, id), payloads.len()).await?;
        assert_eq!(lines, payloads);
    }

    cluster.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn skip_slot_left_as_hole() -> Result<(), PaxosLogError> {
    let mut cluster = Cluster::launch(53871, "skip_slot = 1").await?;
    let (handle, tx_submit, mut rx_deliver, _tx_term) = start_client(
        707,
        53874,
        cluster.roster.clone(),
        "hello_timeout_ms = 100",
    )
    .await?;

    for payload in ["a", "b", "c"] {
        tx_submit.send(payload.into())?;
    }
    for (seq, payload) in ["a", "b", "c"].iter().enumerate() {
        assert_eq!(
            next_delivery(&mut rx_deliver).await?,
            (seq as SeqNum, payload.to_string())
        );
    }
    drop(tx_submit);
    handle.await??;

    // the leader steps over slot 1 and counts it out of its frontier
    let expected = vec![
        (0, "a".to_string()),
        (2, "b".to_string()),
        (3, "c".to_string()),
    ];
    let leader = cluster.wait_for(0, |s| s.chosen.len() >= 3).await?;
    assert!(leader.is_leader);
    assert_eq!(leader.chosen, expected);
    assert_eq!(leader.first_unchosen, 4);

    // followers learn the later slots around the hole, which stays unchosen
    for id in 1..3 {
        let follower = cluster.wait_for(id, |s| s.chosen.len() >= 3).await?;
        assert_eq!(follower.chosen, expected);
        assert_eq!(follower.first_unchosen, 1);
    }

    // nothing past the hole is executable, so only slot 0 reaches disk
    for id in 0..3 {
        assert_eq!(log_lines(log_path(53871, id), 1).await?, vec!["a"]);
    }

    cluster.stop().await
}
