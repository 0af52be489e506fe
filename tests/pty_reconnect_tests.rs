//! S6 — reconnecting a PTY session: a session outlives a viewer
//! disconnecting, a newly attached viewer supersedes the old one's output
//! channel, and scrollback produced before the reconnect is never replayed.

use mobileshell::TerminalSession;
use std::time::Duration;

async fn recv_within(rx: &mut tokio::sync::mpsc::Receiver<Vec<u8>>, timeout: Duration) -> Option<Vec<u8>> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

#[tokio::test]
async fn reconnecting_viewer_does_not_see_output_produced_before_it_attached() {
    let dir = std::env::temp_dir();
    let session = TerminalSession::spawn("proc1".to_string(), "bash", &dir).unwrap();

    let first_generation = session.attach();
    let mut first_rx = session.output_channel(first_generation);

    session.write_input(b"echo before-reconnect\n").await.unwrap();
    // Drain whatever the first viewer sees; it's scrollback once a second
    // viewer attaches.
    let _ = recv_within(&mut first_rx, Duration::from_millis(500)).await;

    // Second viewer attaches. This bumps the generation, which the first
    // viewer's background reader notices on its next read and stops.
    let second_generation = session.attach();
    assert!(second_generation > first_generation);
    let mut second_rx = session.output_channel(second_generation);

    assert!(session.is_running().await, "bash must still be alive across reconnect");

    session.write_input(b"echo after-reconnect\n").await.unwrap();
    let mut saw_after = false;
    for _ in 0..20 {
        if let Some(chunk) = recv_within(&mut second_rx, Duration::from_millis(200)).await {
            if String::from_utf8_lossy(&chunk).contains("after-reconnect") {
                saw_after = true;
                break;
            }
        } else {
            break;
        }
    }
    assert!(saw_after, "reconnected viewer must see output produced after it attached");

    session.write_input(b"exit\n").await.unwrap();
    for _ in 0..50 {
        if !session.is_running().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!session.is_running().await);
}

#[tokio::test]
async fn closing_a_session_escalates_from_sigterm_to_sigkill_within_the_grace_period() {
    let dir = std::env::temp_dir();
    // A command that ignores SIGTERM, so `close()` must escalate to SIGKILL
    // rather than waiting forever.
    let session = TerminalSession::spawn("proc1".to_string(), "trap '' TERM; sleep 30", &dir).unwrap();
    assert!(session.is_running().await);

    let start = std::time::Instant::now();
    session.close().await.unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(3),
        "close() must not exceed the 2s SIGTERM grace window plus a small margin"
    );
    assert!(!session.is_running().await);
}
