// Module assembly contract: a remote-looking configuration with an
// injected connector must assemble and hand out services without dialing
// anything at build time.

use std::sync::Arc;
use std::time::Duration;

use beacon_discovery::{
    ClusterConfig, Credentials, DiscoveryModule, Endpoint, MemberMetadata, ShutdownRegistry,
};
use beacon_ensemble::{EmbeddedConnector, Ensemble, acl::everyone_read_creator_all};

fn remote_looking_config() -> ClusterConfig {
    ClusterConfig::builder()
        .member(Endpoint::new("localhost", 42))
        .chroot("/chroot")
        .in_process(false)
        .session_timeout(Duration::from_secs(24 * 60 * 60))
        .credentials(Credentials::digest("test", "user"))
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_assembly_does_not_dial() {
    // the configured endpoint is unresolvable on purpose; assembly and
    // service construction must still succeed
    let module = DiscoveryModule::builder()
        .config(remote_looking_config())
        .acl(everyone_read_creator_all())
        .connector(Arc::new(EmbeddedConnector::new()))
        .build()
        .unwrap();

    assert_eq!(module.config().chroot.as_deref(), Some("/chroot"));
    assert_eq!(
        module.config().session_timeout,
        Duration::from_secs(24 * 60 * 60)
    );
    assert_eq!(
        module.config().credentials,
        Some(Credentials::digest("test", "user"))
    );

    let (elector, monitor) = module.services("/discovery").unwrap();
    assert_eq!(elector.path(), "/discovery");
    assert_eq!(monitor.path(), "/discovery");
    assert!(!elector.is_leader());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_services_share_one_client_under_chroot() {
    let connector = Arc::new(EmbeddedConnector::new());
    let server = connector.server().clone();
    let module = DiscoveryModule::builder()
        .config(remote_looking_config())
        .acl(everyone_read_creator_all())
        .connector(connector)
        .build()
        .unwrap();

    let (elector, monitor) = module.services("/discovery").unwrap();
    let meta = MemberMetadata::new(Endpoint::new("10.0.0.1", 8081));
    let _leadership = elector.campaign(&meta).await.unwrap();
    let _membership = monitor.join(&meta).await.unwrap();

    // both records live under the configured chroot in the raw namespace
    let raw = server.connect(Duration::from_secs(10));
    let names = raw.children("/chroot/discovery").await.unwrap();
    assert!(names.iter().any(|n| n.starts_with("candidate-")));
    assert!(names.iter().any(|n| n.starts_with("member-")));
    assert!(raw.children("/discovery").await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_tears_down_services() {
    let shutdown = ShutdownRegistry::new();
    let module = DiscoveryModule::builder()
        .config(remote_looking_config())
        .acl(everyone_read_creator_all())
        .connector(Arc::new(EmbeddedConnector::new()))
        .shutdown(shutdown.clone())
        .build()
        .unwrap();

    let (elector, _) = module.services("/discovery").unwrap();
    let meta = MemberMetadata::new(Endpoint::new("10.0.0.1", 8081));
    let _leadership = elector.campaign(&meta).await.unwrap();

    module.shutdown_registry().execute().await;
    assert!(shutdown.is_executed());
    assert!(module.handle().unwrap().is_closed());

    // post-shutdown operations fail instead of reconnecting
    assert!(elector.leader_info().await.is_err());
}
