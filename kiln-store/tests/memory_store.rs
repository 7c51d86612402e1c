use futures::StreamExt;
use kiln_core::domain::hook::TrackedFile;
use kiln_core::domain::project::DeployKeyPair;
use kiln_core::dto::build::NewBuild;
use kiln_core::dto::hook::{NewHook, NewHookCall};
use kiln_core::dto::job::NewJob;
use kiln_core::dto::log::channel_name;
use kiln_core::dto::payload::StoredPayload;
use kiln_store::{
    BuildRepository, HookRepository, JobRepository, LogHub, MemoryLogHub, MemoryStore,
    ProjectRepository,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

fn new_build(project_id: i64, sha: &str) -> NewBuild {
    NewBuild {
        project_id,
        commit_sha: sha.to_string(),
        commit_ref: "refs/heads/master".to_string(),
        commit_author: "Mona".to_string(),
        commit_message: "Update".to_string(),
    }
}

#[tokio::test]
async fn concurrent_build_numbers_are_contiguous_from_one() {
    let store = Arc::new(MemoryStore::new());
    let owner = store.add_user("owner", "Owner", None);
    let project = store.add_project(owner.id, "o/r", "git@example.com:o/r.git");
    let project_id = project.id;

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.next_build_number(project_id).await })
        })
        .collect();

    let mut numbers = BTreeSet::new();
    for handle in handles {
        let number = handle.await.unwrap().unwrap();
        assert!(numbers.insert(number), "duplicate build number {}", number);
    }

    assert_eq!(numbers, (1..=32).collect::<BTreeSet<i64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_for_one_commit_share_a_build() {
    let store = Arc::new(MemoryStore::new());
    let owner = store.add_user("owner", "Owner", None);
    let project = store.add_project(owner.id, "o/r", "git@example.com:o/r.git");
    let project_id = project.id;

    // Push and pull_request hooks for the same two commits, all at once
    let handles: Vec<_> = (0..32)
        .map(|i| {
            let store = store.clone();
            let sha = if i % 2 == 0 { "aaa" } else { "bbb" };
            tokio::spawn(async move {
                store
                    .find_or_create_build(new_build(project_id, sha))
                    .await
            })
        })
        .collect();

    let mut builds = Vec::new();
    let mut created = 0;
    for handle in handles {
        let (build, was_created) = handle.await.unwrap().unwrap();
        if was_created {
            created += 1;
        }
        builds.push(build);
    }

    assert_eq!(created, 2);
    let ids: BTreeSet<i64> = builds.iter().map(|b| b.id).collect();
    assert_eq!(ids.len(), 2);
    let numbers: BTreeSet<i64> = builds.iter().map(|b| b.number).collect();
    assert_eq!(numbers, BTreeSet::from([1, 2]));

    // No number was burnt by the losing callers
    assert_eq!(store.next_build_number(project.id).await.unwrap(), 3);
}

#[tokio::test]
async fn standing_deploy_key_is_loaded_with_project() {
    let store = MemoryStore::new();
    let owner = store.add_user("owner", "Owner", None);
    let project = store.add_project(owner.id, "o/r", "git@example.com:o/r.git");
    assert!(project.deploy_key.is_none());

    store.set_deploy_key(
        project.id,
        DeployKeyPair {
            public_key: "ssh-ed25519 AAAA standing".to_string(),
            private_key: "standing secret".to_string(),
        },
    );

    let loaded = store.get_project(project.id).await.unwrap().unwrap();
    let key = loaded.deploy_key.as_ref().unwrap();
    assert_eq!(key.public_key, "ssh-ed25519 AAAA standing");
    assert!(!format!("{:?}", loaded).contains("standing secret"));
}

#[tokio::test]
async fn deleting_hook_keeps_calls_and_jobs() {
    let store = MemoryStore::new();
    let owner = store.add_user("owner", "Owner", None);
    let project = store.add_project(owner.id, "o/r", "git@example.com:o/r.git");
    let number = store.next_build_number(project.id).await.unwrap();
    let build = store
        .insert_build(new_build(project.id, "abc"), number)
        .await
        .unwrap();
    let hook = store
        .insert_hook(NewHook {
            project_id: project.id,
            title: "ci".to_string(),
            image: "ubuntu:24.04".to_string(),
            build_script: "make".to_string(),
            install_script: None,
            tracked_files: vec![TrackedFile::new("Makefile")],
        })
        .await
        .unwrap();
    let call = store
        .insert_hook_call(NewHookCall {
            hook_id: hook.id,
            build_id: build.id,
            payload: StoredPayload::github("push", serde_json::json!({"after": "abc"})),
        })
        .await
        .unwrap();
    let job = store
        .create_job(NewJob {
            build_id: build.id,
            hook_call_id: call.id,
            task_id: Uuid::new_v4(),
        })
        .await
        .unwrap();

    assert!(store.delete_hook(hook.id).await.unwrap());
    assert!(!store.delete_hook(hook.id).await.unwrap());

    assert!(store.get_hook(hook.id).await.unwrap().is_none());
    let call = store.get_hook_call(call.id).await.unwrap().unwrap();
    assert_eq!(call.hook_id, None);
    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.hook_call_id, call.id);
}

#[tokio::test]
async fn late_subscriber_replays_then_follows() {
    let hub = MemoryLogHub::new();
    let channel = channel_name(7, 9);

    hub.publish(&channel, &["first\n".to_string(), "second\n".to_string()])
        .await
        .unwrap();

    let mut subscription = hub.subscribe(&channel).await.unwrap();
    hub.publish(&channel, &["third\n".to_string()]).await.unwrap();

    assert_eq!(subscription.history, vec!["first\n", "second\n"]);
    assert_eq!(subscription.live.next().await.as_deref(), Some("third\n"));
    assert_eq!(
        hub.history(&channel).await.unwrap(),
        vec!["first\n", "second\n", "third\n"]
    );
}

#[tokio::test]
async fn channels_are_isolated() {
    let hub = MemoryLogHub::new();
    hub.publish(&channel_name(1, 1), &["a\n".to_string()]).await.unwrap();
    hub.publish(&channel_name(1, 2), &["b\n".to_string()]).await.unwrap();

    assert_eq!(hub.history(&channel_name(1, 1)).await.unwrap(), vec!["a\n"]);
    assert_eq!(hub.history(&channel_name(1, 2)).await.unwrap(), vec!["b\n"]);
}
