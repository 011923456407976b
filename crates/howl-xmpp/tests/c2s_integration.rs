//! End-to-end client stream tests against a running server node.

mod common;

use std::time::Duration;

use common::{TestClient, TestServer, TEST_DOMAIN};
use howl_xmpp::c2s::ResourceConflict;
use howl_xmpp::component::handshake_digest;

#[tokio::test]
async fn test_initial_features_require_starttls() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.c2s_addr).await;

    let features = client.open_stream().await;
    assert!(features.contains("<stream:stream"));
    assert!(features.contains("urn:ietf:params:xml:ns:xmpp-tls"));
    assert!(features.contains("<required/>"));
    assert!(!features.contains("<mechanisms"));

    // Authentication before TLS is refused.
    client
        .send("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AG9ydHVtYW4AMTIzNA==</auth>")
        .await;
    let closed = client.expect_closed().await;
    assert!(closed.contains("not-authorized"), "got: {closed}");
    server.stop().await;
}

#[tokio::test]
async fn test_starttls_plain_and_bind() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.c2s_addr).await;
    client.open_stream().await;

    let (mut client, features) = client.starttls(&server.tls.tls_connector()).await;
    assert!(features.contains("<mechanisms"));
    assert!(features.contains("<mechanism>SCRAM-SHA-256</mechanism>"));
    assert!(features.contains("<mechanism>PLAIN</mechanism>"));
    assert!(!features.contains("DIGEST-MD5"));

    let success = client.auth_plain("ortuman", "1234").await;
    assert!(success.contains("<success"), "got: {success}");

    let features = client.open_stream().await;
    assert!(features.contains("urn:ietf:params:xml:ns:xmpp-bind"));
    assert!(features.contains("urn:xmpp:sm:3"));

    let bound = client.bind("balcony").await;
    assert!(bound.contains("<jid>ortuman@localhost/balcony</jid>"), "got: {bound}");
    server.stop().await;
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.c2s_addr).await;
    client.open_stream().await;
    let (mut client, _) = client.starttls(&server.tls.tls_connector()).await;

    let failure = client.auth_plain("ortuman", "wrong").await;
    assert!(failure.contains("<failure"), "got: {failure}");
    assert!(failure.contains("not-authorized"), "got: {failure}");
    server.stop().await;
}

#[tokio::test]
async fn test_message_between_clients() {
    let server = TestServer::start().await;
    let mut ortuman = TestClient::login(&server, "ortuman", "1234", "balcony").await;
    let mut noelia = TestClient::login(&server, "noelia", "5678", "yard").await;

    ortuman
        .send("<message type='chat' id='m1' to='noelia@localhost/yard'><body>hi there</body></message>")
        .await;
    let received = noelia.read_until("</message>").await;
    assert!(received.contains("from='ortuman@localhost/balcony'"), "got: {received}");
    assert!(received.contains("<body>hi there</body>"));
    server.stop().await;
}

#[tokio::test]
async fn test_message_to_missing_resource_bounces() {
    let server = TestServer::start().await;
    let mut ortuman = TestClient::login(&server, "ortuman", "1234", "balcony").await;

    ortuman
        .send("<message type='chat' id='m2' to='noelia@localhost/yard'><body>anyone?</body></message>")
        .await;
    let bounce = ortuman.read_until("</message>").await;
    assert!(bounce.contains("type='error'"), "got: {bounce}");
    assert!(bounce.contains("service-unavailable"), "got: {bounce}");
    server.stop().await;
}

#[tokio::test]
async fn test_ping_the_server() {
    let server = TestServer::start().await;
    let mut client = TestClient::login(&server, "ortuman", "1234", "balcony").await;

    client
        .send(&format!("<iq type='get' id='ping_1' to='{TEST_DOMAIN}'><ping xmlns='urn:xmpp:ping'/></iq>"))
        .await;
    let reply = client.read_until("/>").await;
    assert!(reply.contains("id='ping_1'"), "got: {reply}");
    assert!(reply.contains("type='result'"), "got: {reply}");
    server.stop().await;
}

#[tokio::test]
async fn test_resource_override_disconnects_previous_stream() {
    let server = TestServer::start().await;
    let mut first = TestClient::login(&server, "ortuman", "1234", "balcony").await;
    let _second = TestClient::login(&server, "ortuman", "1234", "balcony").await;

    let closed = first.expect_closed().await;
    assert!(closed.contains("<conflict"), "got: {closed}");
    server.stop().await;
}

#[tokio::test]
async fn test_resource_reject_answers_bind_with_conflict() {
    let server = TestServer::start_with(|config| {
        config.c2s.resource_conflict = ResourceConflict::Reject;
    })
    .await;
    let _first = TestClient::login(&server, "ortuman", "1234", "balcony").await;

    let mut second = TestClient::connect(server.c2s_addr).await;
    second.open_stream().await;
    let (mut second, _) = second.starttls(&server.tls.tls_connector()).await;
    second.auth_plain("ortuman", "1234").await;
    second.open_stream().await;
    let reply = second.bind("balcony").await;
    assert!(reply.contains("type='error'"), "got: {reply}");
    assert!(reply.contains("<conflict"), "got: {reply}");
    server.stop().await;
}

#[tokio::test]
async fn test_stream_resumption_after_connection_loss() {
    let server = TestServer::start().await;
    let mut client = TestClient::login(&server, "ortuman", "1234", "balcony").await;
    client
        .send("<enable xmlns='urn:xmpp:sm:3' resume='true'/>")
        .await;
    let enabled = client.read_until("/>").await;
    assert!(enabled.contains("<enabled"), "got: {enabled}");
    let start = enabled.find(" id='").unwrap() + 5;
    let end = enabled[start..].find('\'').unwrap() + start;
    let smid = enabled[start..end].to_string();

    drop(client);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = TestClient::connect(server.c2s_addr).await;
    client.open_stream().await;
    let (mut client, _) = client.starttls(&server.tls.tls_connector()).await;
    client.auth_plain("ortuman", "1234").await;
    client.open_stream().await;
    client
        .send(&format!("<resume xmlns='urn:xmpp:sm:3' previd='{smid}' h='0'/>"))
        .await;
    let resumed = client.read_until("/>").await;
    assert!(resumed.contains("<resumed"), "got: {resumed}");
    assert!(resumed.contains(&format!("previd='{smid}'")), "got: {resumed}");

    // The resumed stream is addressable again.
    let mut noelia = TestClient::login(&server, "noelia", "5678", "yard").await;
    noelia
        .send("<message id='m3' to='ortuman@localhost/balcony'><body>welcome back</body></message>")
        .await;
    let received = client.read_until("</message>").await;
    assert!(received.contains("welcome back"), "got: {received}");
    server.stop().await;
}

#[tokio::test]
async fn test_resume_with_unknown_id_fails() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.c2s_addr).await;
    client.open_stream().await;
    let (mut client, _) = client.starttls(&server.tls.tls_connector()).await;
    client.auth_plain("ortuman", "1234").await;
    client.open_stream().await;

    client
        .send("<resume xmlns='urn:xmpp:sm:3' previd='bm90LWEtcmVhbC1pZA==' h='0'/>")
        .await;
    let failed = client.read_until("</failed>").await;
    assert!(failed.contains("item-not-found"), "got: {failed}");
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_streams_with_system_shutdown() {
    let server = TestServer::start().await;
    let mut client = TestClient::login(&server, "ortuman", "1234", "balcony").await;

    let stopping = tokio::spawn(server.stop());
    let closed = client.expect_closed().await;
    assert!(closed.contains("system-shutdown"), "got: {closed}");
    stopping.await.unwrap();
}

#[tokio::test]
async fn test_component_receives_routed_message() {
    let server = TestServer::start_with(|config| {
        config.component_addr = Some("127.0.0.1:0".parse().unwrap());
        config
            .component
            .secrets
            .insert("echo.localhost".to_string(), "s3cr3t".to_string());
    })
    .await;

    let mut component = TestClient::connect(server.component_addr.unwrap()).await;
    component
        .send(
            "<stream:stream xmlns='jabber:component:accept' \
             xmlns:stream='http://etherx.jabber.org/streams' to='echo.localhost'>",
        )
        .await;
    let header = component.read_until("version='1.0'>").await;
    let start = header.find(" id='").unwrap() + 5;
    let end = header[start..].find('\'').unwrap() + start;
    let digest = handshake_digest(&header[start..end], "s3cr3t");
    component
        .send(&format!("<handshake>{digest}</handshake>"))
        .await;
    component.read_until("<handshake xmlns='jabber:component:accept'/>").await;
    assert!(server.router.is_component_domain("echo.localhost"));

    let mut client = TestClient::login(&server, "ortuman", "1234", "balcony").await;
    client
        .send("<message id='c1' to='bot@echo.localhost'><body>echo?</body></message>")
        .await;
    let received = component.read_until("</message>").await;
    assert!(received.contains("from='ortuman@localhost/balcony'"), "got: {received}");

    component
        .send("<message id='c2' from='bot@echo.localhost' to='ortuman@localhost/balcony'><body>echo!</body></message>")
        .await;
    let reply = client.read_until("</message>").await;
    assert!(reply.contains("echo!"), "got: {reply}");
    server.stop().await;
}
