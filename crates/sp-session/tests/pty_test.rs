use std::time::Duration;

use sp_session::pty::PtyTransport;
use sp_session::Transport;

#[tokio::test]
async fn pty_transport_reads_child_output() {
    let mut transport = PtyTransport::spawn("/bin/echo", &["hello".into(), "world".into()], &[])
        .expect("failed to spawn echo");

    let mut output = Vec::new();
    let read_all = async {
        while let Some(chunk) = transport.read().await.unwrap() {
            output.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&output).contains("hello world") {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read_all)
        .await
        .expect("timed out reading pty output");

    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("hello world"), "got: {text:?}");
    transport.close().await.unwrap();
}

#[tokio::test]
async fn pty_transport_round_trips_through_cat() {
    let mut transport =
        PtyTransport::spawn("/bin/cat", &[], &[]).expect("failed to spawn cat");
    transport.write(b"ping\n").await.unwrap();

    let mut output = Vec::new();
    let read_echo = async {
        while let Some(chunk) = transport.read().await.unwrap() {
            output.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&output).contains("ping") {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read_echo)
        .await
        .expect("timed out waiting for echo");

    assert!(transport.is_alive());
    transport.close().await.unwrap();
    transport.close().await.unwrap();
}

#[test]
fn spawn_missing_program_fails() {
    let result = PtyTransport::spawn("/nonexistent/ssh-binary", &[], &[]);
    assert!(result.is_err());
}
