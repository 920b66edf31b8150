//! Tests for Unicode support and correct cursor transformation.

pub mod common;

use std::sync::Arc;

use anyhow::Result;
use common::*;
use copad_server::ot::OperationSeq;
use copad_server::{ServerState, server};
use serde_json::json;
use tracing::info;

#[tokio::test]
async fn test_unicode_length() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    client.expect_text("unicode", "").await;

    let mut socket = client.connect("unicode").await?;
    let msg = socket.recv().await?;
    assert_eq!(msg, json!({ "Identity": 0 }));

    let mut operation = OperationSeq::default();
    operation.insert("h🎉e🎉l👨‍👨‍👦‍👦lo");
    let msg = json!({
        "Edit": {
            "revision": 0,
            "operation": operation
        }
    });
    info!("sending ClientMsg {}", msg);
    socket.send(&msg).await;

    let msg = socket.recv().await?;
    assert_eq!(
        msg,
        json!({
            "History": {
                "start": 0,
                "operations": [
                    { "id": 0, "operation": ["h🎉e🎉l👨‍👨‍👦‍👦lo"] }
                ]
            }
        })
    );

    info!("testing that text length is equal to number of Unicode scalar values...");
    let mut operation = OperationSeq::default();
    operation.delete(14);
    let msg = json!({
        "Edit": {
            "revision": 1,
            "operation": operation
        }
    });
    info!("sending ClientMsg {}", msg);
    socket.send(&msg).await;

    let msg = socket.recv().await?;
    assert_eq!(
        msg,
        json!({
            "History": {
                "start": 1,
                "operations": [
                    { "id": 0, "operation": [-14] }
                ]
            }
        })
    );

    client.expect_text("unicode", "").await;

    Ok(())
}

#[tokio::test]
async fn test_insert_after_emoji() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut socket = client.connect("emoji").await?;
    assert_eq!(socket.recv().await?, json!({ "Identity": 0 }));

    // "a😀b" is three scalar values even though the emoji is four UTF-8
    // bytes.
    socket
        .send(&json!({ "Edit": { "revision": 0, "operation": ["a😀b"] } }))
        .await;
    socket.recv().await?;

    socket
        .send(&json!({ "Edit": { "revision": 1, "operation": [2, "!", 1] } }))
        .await;
    let msg = socket.recv().await?;
    assert_eq!(
        msg,
        json!({
            "History": {
                "start": 1,
                "operations": [{ "id": 0, "operation": [2, "!", 1] }]
            }
        })
    );
    client.expect_text("emoji", "a😀!b").await;

    Ok(())
}

#[tokio::test]
async fn test_insert_at_end_counts_scalars() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut socket = client.connect("emoji-end").await?;
    assert_eq!(socket.recv().await?, json!({ "Identity": 0 }));

    socket
        .send(&json!({ "Edit": { "revision": 0, "operation": ["a😀b"] } }))
        .await;
    socket.recv().await?;

    // A retain of the full three scalars is a valid insert at the end.
    socket
        .send(&json!({ "Edit": { "revision": 1, "operation": [3, "!"] } }))
        .await;
    let msg = socket.recv().await?;
    assert_eq!(
        msg,
        json!({
            "History": {
                "start": 1,
                "operations": [{ "id": 0, "operation": [3, "!"] }]
            }
        })
    );
    client.expect_text("emoji-end", "a😀b!").await;

    Ok(())
}

#[tokio::test]
async fn test_unicode_cursors() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut socket = client.connect("unicode").await?;
    assert_eq!(socket.recv().await?, json!({ "Identity": 0 }));

    let mut operation = OperationSeq::default();
    operation.insert("🎉🎉🎉");
    let msg = json!({
        "Edit": {
            "revision": 0,
            "operation": operation
        }
    });
    info!("sending ClientMsg {}", msg);
    socket.send(&msg).await;
    socket.recv().await?;

    let cursors = json!({
        "cursors": [0, 1, 2, 3],
        "selections": [[0, 1], [2, 3]]
    });
    socket.send(&json!({ "CursorData": cursors })).await;

    let cursors_resp = json!({
        "UserCursor": {
            "id": 0,
            "data": cursors
        }
    });
    assert_eq!(socket.recv().await?, cursors_resp);

    let mut socket2 = client.connect("unicode").await?;
    assert_eq!(socket2.recv().await?, json!({ "Identity": 1 }));
    socket2.recv().await?; // history replay
    assert_eq!(socket2.recv().await?, cursors_resp);

    // A concurrent insert from the second client lands after the committed
    // text and pushes only the cursor sitting at the end.
    let msg = json!({
        "Edit": {
            "revision": 0,
            "operation": ["🎉"]
        }
    });
    socket2.send(&msg).await;

    let mut socket3 = client.connect("unicode").await?;
    assert_eq!(socket3.recv().await?, json!({ "Identity": 2 }));
    socket3.recv().await?; // history replay

    let transformed_cursors_resp = json!({
        "UserCursor": {
            "id": 0,
            "data": {
                "cursors": [0, 1, 2, 4],
                "selections": [[0, 1], [2, 4]]
            }
        }
    });
    assert_eq!(socket3.recv().await?, transformed_cursors_resp);

    Ok(())
}
