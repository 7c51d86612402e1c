use kiln_core::domain::status::CommitStatus;
use kiln_core::source::{EntryKind, RemoteContent, SourceHost, SourceHostError};
use kiln_github::GitHubClient;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn file_content_resolves_to_sha() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/repos/octo/repo/contents/install.sh"))
        .and(query_param("ref", "abc123"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "file",
            "name": "install.sh",
            "path": "install.sh",
            "sha": "f00d"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = GitHubClient::new(server.uri(), "secret");
    let content = client
        .get_content("octo/repo", "install.sh", "abc123")
        .await
        .unwrap();

    assert_eq!(content, Some(RemoteContent::File { sha: "f00d".into() }));
}

#[tokio::test]
async fn directory_lists_entries() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/repos/octo/repo/contents/deps"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"type": "file", "path": "deps/a.txt", "sha": "1"},
            {"type": "dir", "path": "deps/nested", "sha": "2"}
        ])))
        .mount(&server)
        .await;

    let client = GitHubClient::new(server.uri(), "secret");
    let Some(RemoteContent::Dir(entries)) = client
        .get_content("octo/repo", "deps", "master")
        .await
        .unwrap()
    else {
        panic!("expected a directory");
    };

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].path, "deps/a.txt");
    assert_eq!(entries[1].kind, EntryKind::Dir);
}

#[tokio::test]
async fn missing_path_is_absent() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/repos/octo/repo/contents/gone.txt"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
        .mount(&server)
        .await;

    let client = GitHubClient::new(server.uri(), "secret");
    let content = client
        .get_content("octo/repo", "gone.txt", "master")
        .await
        .unwrap();

    assert_eq!(content, None);
}

#[tokio::test]
async fn server_errors_are_reported() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let client = GitHubClient::new(server.uri(), "secret");
    let err = client
        .get_content("octo/repo", "x", "master")
        .await
        .unwrap_err();

    assert!(matches!(err, SourceHostError::Api { status: 502, .. }));
}

#[tokio::test]
async fn status_is_posted_with_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/repos/octo/repo/statuses/abc123"))
        .and(body_partial_json(json!({
            "state": "failure",
            "target_url": "https://kiln.example/projects/1/builds/2",
            "description": "Kiln build #2 has failed.",
            "context": "kiln"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let client = GitHubClient::new(server.uri(), "secret");
    client
        .set_commit_status(
            "octo/repo",
            "abc123",
            CommitStatus::Failure,
            "https://kiln.example/projects/1/builds/2",
            "Kiln build #2 has failed.",
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn deploy_key_is_added_read_only_and_removed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/repos/octo/repo/keys"))
        .and(body_partial_json(json!({
            "title": "kiln job 5",
            "key": "ssh-ed25519 AAAA kiln",
            "read_only": true
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 77, "title": "kiln job 5"})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/repos/octo/repo/keys/77"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = GitHubClient::new(server.uri(), "secret");
    let id = client
        .add_deploy_key("octo/repo", "kiln job 5", "ssh-ed25519 AAAA kiln\n")
        .await
        .unwrap();
    assert_eq!(id, 77);

    client.remove_deploy_key("octo/repo", id).await.unwrap();
}
