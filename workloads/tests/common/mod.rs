#![allow(dead_code)]

use rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SanType,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use workload_identity::{MaterialWatcher, TrustDomain, X509Material};
use workloads::http::Server;

pub const CLIENT_ID: &str = "spiffe://example.org/ns/demo/sa/ping-pong-client";
pub const SERVER_ID: &str = "spiffe://example.org/ns/demo/sa/ping-pong-server";

/// A throwaway SPIFFE CA for one trust domain.
pub struct TestCa {
    trust_domain: String,
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(trust_domain: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self {
            trust_domain: trust_domain.to_string(),
            cert,
            key,
        }
    }

    pub fn watcher(&self, spiffe_id: &str) -> MaterialWatcher {
        MaterialWatcher::fixed(&self.material(spiffe_id)).unwrap()
    }

    pub fn material(&self, spiffe_id: &str) -> X509Material {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.subject_alt_names = vec![SanType::URI(spiffe_id.try_into().unwrap())];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        X509Material::new(vec![cert.der().clone()], key.serialize_der()).with_bundle(
            TrustDomain::new(&self.trust_domain).unwrap(),
            vec![self.cert.der().clone()],
        )
    }
}

/// A server running on an ephemeral local port.
pub struct Running {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<workloads::Result<()>>,
}

impl Running {
    pub fn start(server: Server, router: axum::Router) -> Self {
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(router, shutdown.clone()));
        Self {
            addr,
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
    }
}

pub async fn bind_local() -> Server {
    Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
}
