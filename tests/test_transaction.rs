//! Integration tests: MULTI/EXEC, WATCH and DISCARD.

mod common;

use common::*;
use muxredis::{cmd, MuxredisError, ReplyKind, Response, RespValue};

#[tokio::test]
async fn manual_multi_exec() {
    let server = MockServer::start().await;
    let conn = connect(&server).await;

    conn.execute(cmd!("MULTI")).await.unwrap();
    assert!(conn.in_transaction());

    let queued = conn.query(cmd!("SET", "m", 1)).await.unwrap();
    assert_eq!(queued, RespValue::SimpleString("QUEUED".into()));
    conn.execute(cmd!("INCR", "m")).await.unwrap();
    conn.execute(cmd!("GET", "m")).await.unwrap();

    let items = match conn.execute(cmd!("EXEC")).await.unwrap() {
        Response::Exec(items) => items,
        other => panic!("expected EXEC result, got {other:?}"),
    };
    assert!(!conn.in_transaction());
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_ref().unwrap(), &ok());
    assert_eq!(items[1].as_ref().unwrap(), &RespValue::Integer(2));
    assert_eq!(items[2].as_ref().unwrap(), &bulk("2"));
}

#[tokio::test]
async fn runtime_error_is_confined_to_its_slot() {
    let server = MockServer::start().await;
    let conn = connect(&server).await;
    server.set(0, "word", "abc");

    let items = conn
        .multi_exec()
        .cmd(cmd!("INCR", "word"))
        .cmd(cmd!("SET", "after", "yes"))
        .execute()
        .await
        .unwrap();

    assert_eq!(items[0].as_ref().unwrap_err().reply_kind(), Some(&ReplyKind::Err));
    assert_eq!(items[1].as_ref().unwrap(), &ok());
    assert_eq!(server.get(0, "after").as_deref(), Some(&b"yes"[..]));
}

#[tokio::test]
async fn changed_watch_key_fails_every_command() {
    let server = MockServer::start().await;
    let conn = connect(&server).await;

    conn.execute(cmd!("WATCH", "balance")).await.unwrap();
    server.set(0, "balance", "100");

    let items = conn
        .multi_exec()
        .cmd(cmd!("SET", "balance", "0"))
        .cmd(cmd!("INCR", "withdrawals"))
        .execute()
        .await
        .unwrap();

    assert_eq!(items.len(), 2);
    assert!(items
        .iter()
        .all(|item| matches!(item, Err(MuxredisError::WatchChanged))));
    assert_eq!(server.get(0, "balance").as_deref(), Some(&b"100"[..]));
    assert!(!conn.in_transaction());
}

#[tokio::test]
async fn unchanged_watch_key_commits() {
    let server = MockServer::start().await;
    let conn = connect(&server).await;

    conn.execute(cmd!("WATCH", "stock")).await.unwrap();
    let items = conn
        .multi_exec()
        .cmd(cmd!("SET", "stock", 9))
        .execute()
        .await
        .unwrap();
    assert_eq!(items[0].as_ref().unwrap(), &ok());
    assert_eq!(server.get(0, "stock").as_deref(), Some(&b"9"[..]));
}

#[tokio::test]
async fn discard_drops_queued_commands() {
    let server = MockServer::start().await;
    let conn = connect(&server).await;

    conn.execute(cmd!("MULTI")).await.unwrap();
    conn.execute(cmd!("SET", "never", 1)).await.unwrap();
    conn.execute(cmd!("DISCARD")).await.unwrap();

    assert!(!conn.in_transaction());
    assert_eq!(server.get(0, "never"), None);
    assert_eq!(conn.query(cmd!("GET", "never")).await.unwrap(), RespValue::Null);
}

#[tokio::test]
async fn unknown_command_aborts_exec() {
    let server = MockServer::start().await;
    let conn = connect(&server).await;

    let err = conn
        .multi_exec()
        .cmd(cmd!("SET", "k", 1))
        .cmd(cmd!("BOGUS"))
        .execute()
        .await
        .unwrap_err();

    assert_eq!(err.reply_kind(), Some(&ReplyKind::ExecAbort));
    assert!(!conn.in_transaction());
    assert_eq!(server.get(0, "k"), None);
    // The connection stays usable.
    assert_eq!(conn.query(cmd!("PING")).await.unwrap(), RespValue::SimpleString("PONG".into()));
}

#[tokio::test]
async fn select_inside_transaction_applies_on_exec() {
    let server = MockServer::start().await;
    let conn = connect(&server).await;

    let items = conn
        .multi_exec()
        .cmd(cmd!("SELECT", 6))
        .cmd(cmd!("SET", "in6", "x"))
        .execute()
        .await
        .unwrap();
    assert!(items.iter().all(|item| item.is_ok()));
    assert_eq!(conn.db(), 6);
    assert!(server.get(6, "in6").is_some());
}

#[tokio::test]
async fn exec_without_multi_is_rejected_locally() {
    let server = MockServer::start().await;
    let conn = connect(&server).await;

    let err = conn.execute(cmd!("EXEC")).await.unwrap_err();
    assert!(matches!(err, MuxredisError::InvalidArgument(_)));
    conn.execute(cmd!("MULTI")).await.unwrap();
    let err = conn.execute(cmd!("MULTI")).await.unwrap_err();
    assert!(matches!(err, MuxredisError::InvalidArgument(_)));
    conn.execute(cmd!("DISCARD")).await.unwrap();
}
