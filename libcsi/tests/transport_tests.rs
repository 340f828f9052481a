use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use libcsi::backend::memory::InMemoryBackend;
use libcsi::transport::client::CsiClient;
use libcsi::transport::server::CsiServer;
use libcsi::*;
use quinn::crypto::rustls::QuicClientConfig;
use rcgen::{CertificateParams, KeyPair};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::task::JoinHandle;

const GIB: u64 = 1024 * 1024 * 1024;
const SERVER_NAME: &str = "csi.test";

type Controller = VolumeController<InMemoryBackend>;

/// Self-signed CA plus a server certificate it signed.
struct TestCerts {
    ca_cert_der: CertificateDer<'static>,
    server_cert_der: CertificateDer<'static>,
    server_key_der: Vec<u8>,
}

impl TestCerts {
    fn generate() -> Self {
        let ca_key = KeyPair::generate().expect("generate CA key");
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).expect("self-sign CA");

        let server_key = KeyPair::generate().expect("generate server key");
        let mut server_params =
            CertificateParams::new(vec![SERVER_NAME.to_owned()]).expect("server cert params");
        server_params.is_ca = rcgen::IsCa::NoCa;
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .expect("sign server cert");

        Self {
            ca_cert_der: CertificateDer::from(ca_cert.der().to_vec()),
            server_cert_der: CertificateDer::from(server_cert.der().to_vec()),
            server_key_der: server_key.serialize_der(),
        }
    }

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    fn server_config(&self) -> rustls::ServerConfig {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server_key_der.clone()));
        rustls::ServerConfig::builder_with_provider(Self::provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .expect("TLS 1.3")
            .with_no_client_auth()
            .with_single_cert(vec![self.server_cert_der.clone()], key)
            .expect("server TLS config")
    }

    fn client_config(&self) -> rustls::ClientConfig {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.ca_cert_der.clone()).expect("trust test CA");
        rustls::ClientConfig::builder_with_provider(Self::provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .expect("TLS 1.3")
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// A controller served over QUIC on a loopback port.
struct Loopback {
    certs: TestCerts,
    controller: Controller,
    server: Arc<CsiServer<Controller>>,
    serving: JoinHandle<Result<(), CsiError>>,
    addr: SocketAddr,
}

impl Loopback {
    fn start(backend: InMemoryBackend) -> Self {
        let certs = TestCerts::generate();
        let controller = VolumeController::new(
            Arc::new(backend),
            Arc::new(VolumeRegistry::in_memory()),
            ControllerConfig::default(),
        );
        let server = Arc::new(
            CsiServer::new(
                SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
                certs.server_config(),
                Arc::new(controller.clone()),
            )
            .unwrap(),
        );
        let addr = server.endpoint().local_addr().unwrap();
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve().await })
        };
        Self {
            certs,
            controller,
            server,
            serving,
            addr,
        }
    }

    async fn client(&self) -> CsiClient {
        CsiClient::connect(self.addr, SERVER_NAME, self.certs.client_config())
            .await
            .unwrap()
    }

    /// Send raw bytes on a fresh stream and decode the reply.
    async fn exchange_raw(&self, payload: &[u8]) -> CsiMessage {
        let crypto = QuicClientConfig::try_from(self.certs.client_config()).unwrap();
        let mut endpoint =
            quinn::Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).unwrap();
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));
        let conn = endpoint
            .connect(self.addr, SERVER_NAME)
            .unwrap()
            .await
            .unwrap();

        let (mut send, mut recv) = conn.open_bi().await.unwrap();
        send.write_all(payload).await.unwrap();
        send.finish().unwrap();
        let buf = recv.read_to_end(1024 * 1024).await.unwrap();
        conn.close(quinn::VarInt::from_u32(0), b"done");
        serde_json::from_slice(&buf).unwrap()
    }
}

fn create_req(name: &str) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.into(),
        capacity_range: Some(CapacityRange::at_least(GIB)),
        volume_capabilities: vec![VolumeCapability::mount(AccessMode::SingleNodeWriter)],
        ..Default::default()
    }
}

fn publish_req(volume_id: &VolumeId, node: &str) -> ControllerPublishVolumeRequest {
    ControllerPublishVolumeRequest {
        volume_id: volume_id.clone(),
        node_id: node.into(),
        volume_capability: VolumeCapability::mount(AccessMode::SingleNodeWriter),
        read_only: false,
        secrets: Secrets::default(),
        volume_context: HashMap::new(),
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn volume_lifecycle_over_quic() {
    let lb = Loopback::start(InMemoryBackend::new(10 * GIB));
    let client = lb.client().await;

    assert!(client.probe().await.unwrap());
    assert_eq!(
        client.get_plugin_info().await.unwrap().name,
        lb.controller.get_plugin_info().await.unwrap().name
    );
    assert_eq!(
        client.get_plugin_capabilities().await.unwrap(),
        vec![PluginCapability::ControllerService]
    );
    assert_eq!(
        client.controller_get_capabilities().await.unwrap(),
        vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::PublishUnpublishVolume,
            ControllerCapability::ListVolumes,
            ControllerCapability::GetCapacity,
        ]
    );

    let vol = client.create_volume(create_req("data")).await.unwrap();
    let replay = client.create_volume(create_req("data")).await.unwrap();
    assert_eq!(vol, replay);
    assert_eq!(lb.controller.backend().calls().provision, 1);

    let context = client
        .controller_publish_volume(publish_req(&vol.volume_id, "node-a"))
        .await
        .unwrap();
    assert_eq!(context["devicePath"], format!("/dev/mem/{}", vol.volume_id));
    let replayed = client
        .controller_publish_volume(publish_req(&vol.volume_id, "node-a"))
        .await
        .unwrap();
    assert_eq!(context, replayed);
    assert_eq!(lb.controller.backend().calls().attach, 1);

    let page = client
        .list_volumes(ListVolumesRequest::default())
        .await
        .unwrap();
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].published_node_ids, vec![NodeId::from("node-a")]);
    assert_eq!(
        client
            .get_capacity(GetCapacityRequest::default())
            .await
            .unwrap(),
        9 * GIB
    );

    client
        .controller_unpublish_volume(ControllerUnpublishVolumeRequest {
            volume_id: vol.volume_id.clone(),
            node_id: Some("node-a".into()),
            secrets: Secrets::default(),
        })
        .await
        .unwrap();
    client
        .delete_volume(DeleteVolumeRequest {
            volume_id: vol.volume_id.clone(),
            secrets: Secrets::default(),
        })
        .await
        .unwrap();
    assert!(lb.controller.registry().is_empty());

    client.close();
    lb.server.shutdown();
}

#[tokio::test]
async fn controller_errors_keep_their_code_over_quic() {
    let lb = Loopback::start(InMemoryBackend::new(10 * GIB));
    let client = lb.client().await;

    let missing = VolumeId("no-such-volume".into());
    let err = client
        .controller_publish_volume(publish_req(&missing, "node-a"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    let vol = client.create_volume(create_req("data")).await.unwrap();
    let mut bigger = create_req("data");
    bigger.capacity_range = Some(CapacityRange::at_least(2 * GIB));
    let err = client.create_volume(bigger).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyExists);

    client
        .controller_publish_volume(publish_req(&vol.volume_id, "node-a"))
        .await
        .unwrap();
    let err = client
        .delete_volume(DeleteVolumeRequest {
            volume_id: vol.volume_id.clone(),
            secrets: Secrets::default(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedPrecondition);

    lb.server.shutdown();
}

#[tokio::test]
async fn malformed_request_is_invalid_argument() {
    let lb = Loopback::start(InMemoryBackend::new(10 * GIB));

    match lb.exchange_raw(b"{not json").await {
        CsiMessage::Error(e) => assert_eq!(e.code(), ErrorCode::InvalidArgument),
        other => panic!("expected an error reply, got {other}"),
    }

    // A well-formed response variant is not a request either.
    let body = serde_json::to_vec(&CsiMessage::Ok).unwrap();
    match lb.exchange_raw(&body).await {
        CsiMessage::Error(e) => assert_eq!(e.code(), ErrorCode::InvalidArgument),
        other => panic!("expected an error reply, got {other}"),
    }

    assert_eq!(lb.controller.backend().calls().provision, 0);
    lb.server.shutdown();
}

#[tokio::test]
async fn closed_connection_does_not_undo_a_running_create() {
    let lb = Loopback::start(
        InMemoryBackend::new(10 * GIB).with_latency(Duration::from_millis(300)),
    );
    let client = Arc::new(lb.client().await);

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.create_volume(create_req("slow")).await })
    };
    let backend = lb.controller.backend();
    eventually("provision to start", || backend.calls().provision == 1).await;

    client.close();
    assert!(pending.await.unwrap().is_err());

    let registry = lb.controller.registry();
    eventually("create to be recorded", || {
        registry.lookup_name("slow").is_some()
    })
    .await;
    assert_eq!(backend.calls().provision, 1);

    // A retry on a new connection replays the recorded volume.
    let retry = lb.client().await;
    let vol = retry.create_volume(create_req("slow")).await.unwrap();
    assert_eq!(registry.lookup_name("slow"), Some(vol.volume_id));
    assert_eq!(backend.calls().provision, 1);

    lb.server.shutdown();
}

#[tokio::test]
async fn shutdown_stops_serving() {
    let lb = Loopback::start(InMemoryBackend::new(10 * GIB));
    let client = lb.client().await;
    client.create_volume(create_req("data")).await.unwrap();

    lb.server.shutdown();
    let served = tokio::time::timeout(Duration::from_secs(5), lb.serving)
        .await
        .expect("serve returns after shutdown")
        .unwrap();
    assert!(served.is_ok());

    let err = client.create_volume(create_req("other")).await.unwrap_err();
    assert!(matches!(err, CsiError::TransportError(_)), "{err}");
    assert!(lb.controller.registry().lookup_name("other").is_none());
}
