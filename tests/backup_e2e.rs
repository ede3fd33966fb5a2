use backup_server::config::Config;
use backup_server::protocols::backup::parser::Request;
use backup_server::protocols::backup::response::{read_response, Response, Status};
use backup_server::server::Server;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

const CLIENT_VERSION: u8 = 1;

async fn start_server(base_dir: &std::path::Path) -> SocketAddr {
    let config = Config {
        base_dir: base_dir.to_path_buf(),
        chunk_size: 1024,
        ..Config::default()
    };
    let server = Server::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

async fn send(stream: &mut TcpStream, user_id: u32, request: Request, payload: &[u8]) -> Response {
    let mut frame = BytesMut::new();
    request
        .encode_into(user_id, CLIENT_VERSION, &mut frame)
        .unwrap();
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.unwrap();
    read_response(stream).await.unwrap()
}

fn name(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backup_restore_delete_list_over_tcp() {
    let tmp = tempfile::tempdir().unwrap();
    let addr = start_server(tmp.path()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let r = send(
        &mut stream,
        42,
        Request::Backup {
            name: name("a.txt"),
            payload_len: 5,
        },
        b"hello",
    )
    .await;
    assert_eq!(r.status(), Some(Status::GeneralSuccess));
    assert_eq!(r.name, Some(name("a.txt")));
    assert_eq!(std::fs::read(tmp.path().join("42/a.txt")).unwrap(), b"hello");

    let r = send(&mut stream, 42, Request::Restore { name: name("a.txt") }, b"").await;
    assert_eq!(r.status(), Some(Status::RestoreSuccess));
    assert_eq!(r.content, Some(Bytes::from_static(b"hello")));

    let r = send(&mut stream, 42, Request::List, b"").await;
    assert_eq!(r.status(), Some(Status::ListSuccess));
    assert_eq!(r.content, Some(Bytes::from_static(b"a.txt\n")));

    let r = send(&mut stream, 42, Request::Delete { name: name("a.txt") }, b"").await;
    assert_eq!(r.status(), Some(Status::GeneralSuccess));
    assert_eq!(r.name, Some(name("a.txt")));

    let r = send(&mut stream, 42, Request::Restore { name: name("a.txt") }, b"").await;
    assert_eq!(r.status(), Some(Status::ErrorNoFile));
    assert_eq!(r.name, Some(name("a.txt")));

    let r = send(&mut stream, 99, Request::List, b"").await;
    assert_eq!(r.status(), Some(Status::ErrorNoFilesForClient));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_payload_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let addr = start_server(tmp.path()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let payload: Vec<u8> = (0..1_100_000u32).map(|i| (i % 251) as u8).collect();
    let r = send(
        &mut stream,
        7,
        Request::Backup {
            name: name("big.bin"),
            payload_len: payload.len() as u32,
        },
        &payload,
    )
    .await;
    assert_eq!(r.status(), Some(Status::GeneralSuccess));

    let r = send(&mut stream, 7, Request::Restore { name: name("big.bin") }, b"").await;
    assert_eq!(r.content.as_deref(), Some(&payload[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn users_are_isolated_across_connections() {
    let tmp = tempfile::tempdir().unwrap();
    let addr = start_server(tmp.path()).await;

    let mut tasks = Vec::new();
    for user_id in [1u32, 2] {
        tasks.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let content = format!("user {}", user_id);
            let r = send(
                &mut stream,
                user_id,
                Request::Backup {
                    name: name("same-name"),
                    payload_len: content.len() as u32,
                },
                content.as_bytes(),
            )
            .await;
            assert_eq!(r.status(), Some(Status::GeneralSuccess));

            let r = send(&mut stream, user_id, Request::Restore { name: name("same-name") }, b"").await;
            assert_eq!(r.content.as_deref(), Some(content.as_bytes()));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(std::fs::read(tmp.path().join("1/same-name")).unwrap(), b"user 1");
    assert_eq!(std::fs::read(tmp.path().join("2/same-name")).unwrap(), b"user 2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_upload_leaves_no_file() {
    let tmp = tempfile::tempdir().unwrap();
    let addr = start_server(tmp.path()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut frame = BytesMut::new();
    Request::Backup {
        name: name("half.bin"),
        payload_len: 4096,
    }
    .encode_into(3, CLIENT_VERSION, &mut frame)
    .unwrap();
    frame.extend_from_slice(&[0xab; 100]);
    stream.write_all(&frame).await.unwrap();
    drop(stream);

    // A fresh connection observes the outcome once the server has cleaned up
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut status = None;
    for _ in 0..50 {
        let r = send(&mut stream, 3, Request::Restore { name: name("half.bin") }, b"").await;
        status = r.status();
        if status == Some(Status::ErrorNoFile) && std::fs::read_dir(tmp.path().join(".staging")).unwrap().next().is_none() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(status, Some(Status::ErrorNoFile));
    assert!(!tmp.path().join("3/half.bin").exists());
}
