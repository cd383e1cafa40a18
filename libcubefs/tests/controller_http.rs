//! Drives the controller service against an in-process CubeFS master served
//! with axum, exercising the real HTTP transport and failover.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::Json;
use md5::{Digest, Md5};
use serde_json::{Value, json};

use libcubefs::{
    BackendConfig, CapacityRange, CreateVolumeRequest, CsiController, CubeFsBackend,
    DeleteVolumeRequest, StatusCode, VolumeCapability, VolumeId,
};

/// Volume name -> owner.
#[derive(Clone, Default)]
struct Master {
    volumes: Arc<Mutex<HashMap<String, String>>>,
}

async fn create_vol(
    State(master): State<Master>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Value> {
    let (Some(name), Some(owner), Some(_capacity)) = (q.get("name"), q.get("owner"), q.get("capacity"))
    else {
        return Json(json!({"code": 2, "msg": "parameter missing"}));
    };
    let mut volumes = master.volumes.lock().unwrap();
    if volumes.contains_key(name) {
        return Json(json!({"code": 1, "msg": format!("duplicate vol {name}")}));
    }
    volumes.insert(name.clone(), owner.clone());
    Json(json!({"code": 0, "msg": "success", "data": format!("create vol[{name}] successfully")}))
}

async fn delete_vol(
    State(master): State<Master>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Value> {
    let name = q.get("name").cloned().unwrap_or_default();
    let auth_key = q.get("authKey").cloned().unwrap_or_default();
    let mut volumes = master.volumes.lock().unwrap();
    let Some(owner) = volumes.get(&name) else {
        return Json(json!({"code": 7, "msg": "vol not exists"}));
    };
    if hex::encode(Md5::digest(owner.as_bytes())) != auth_key {
        return Json(json!({"code": 8, "msg": "client not authenticated"}));
    }
    volumes.remove(&name);
    Json(json!({"code": 0, "msg": "success"}))
}

async fn spawn_master() -> (SocketAddr, Master) {
    let master = Master::default();
    let app = Router::new()
        .route("/admin/createVol", get(create_vol))
        .route("/vol/delete", get(delete_vol))
        .with_state(master.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (addr, master)
}

/// Answers every request with a non-JSON body.
async fn spawn_garbage() -> SocketAddr {
    let app = Router::new().fallback(|| async { "<html>502 Bad Gateway</html>" });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn backend() -> CubeFsBackend {
    CubeFsBackend::with_host(BackendConfig {
        node_id: "controller-0".into(),
        ..Default::default()
    })
    .unwrap()
}

fn create_req(name: &str, masters: &str) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.into(),
        capacity_range: Some(CapacityRange {
            required_bytes: 2 << 30,
            limit_bytes: 0,
        }),
        volume_capabilities: vec![VolumeCapability::default()],
        parameters: HashMap::from([("masterAddr".to_owned(), masters.to_owned())]),
    }
}

#[tokio::test]
async fn create_and_delete_are_idempotent() {
    let (addr, master) = spawn_master().await;
    let backend = backend();

    let vol = backend
        .create_volume(create_req("vol1", &addr.to_string()))
        .await
        .unwrap();
    assert_eq!(vol.volume_id, VolumeId::from("vol1"));
    assert_eq!(
        master.volumes.lock().unwrap().get("vol1"),
        vol.volume_context.get("owner")
    );

    // Duplicate create reports success.
    backend
        .create_volume(create_req("vol1", &addr.to_string()))
        .await
        .unwrap();

    let delete = DeleteVolumeRequest {
        volume_id: vol.volume_id.clone(),
        volume_context: vol.volume_context.clone(),
    };
    backend.delete_volume(delete.clone()).await.unwrap();
    assert!(master.volumes.lock().unwrap().is_empty());

    // The volume is gone; deleting again still succeeds.
    backend.delete_volume(delete).await.unwrap();
}

#[tokio::test]
async fn delete_with_wrong_owner_is_unknown() {
    let (addr, _master) = spawn_master().await;
    let backend = backend();

    let vol = backend
        .create_volume(create_req("vol1", &addr.to_string()))
        .await
        .unwrap();
    let mut context = vol.volume_context;
    context.insert("owner".into(), "someone-else".into());

    let err = backend
        .delete_volume(DeleteVolumeRequest {
            volume_id: vol.volume_id,
            volume_context: context,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::Unknown);
    assert!(err.to_string().contains("client not authenticated"), "{err}");
}

#[tokio::test]
async fn unreachable_and_garbage_masters_are_skipped() {
    let (addr, master) = spawn_master().await;
    let garbage = spawn_garbage().await;
    let backend = backend();

    // Port 1 on loopback refuses connections.
    let masters = format!("127.0.0.1:1,{garbage},http://{addr}");
    backend
        .create_volume(create_req("vol1", &masters))
        .await
        .unwrap();
    assert!(master.volumes.lock().unwrap().contains_key("vol1"));
}

#[tokio::test]
async fn all_masters_unreachable_is_internal() {
    let garbage = spawn_garbage().await;
    let backend = backend();

    let err = backend
        .create_volume(create_req("vol1", &format!("127.0.0.1:1,{garbage}")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::Internal);
    assert!(err.to_string().contains("all endpoints"), "{err}");
}
