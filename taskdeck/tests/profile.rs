mod common;

use std::sync::Arc;

use common::{FlakyStore, Op, memory_store, principal};
use taskdeck::{EditMode, ProfileEditor, ProfileError, RemoteStore};

#[tokio::test]
async fn test_profile_is_created_on_first_load() {
    let store = memory_store().await;
    let user = principal().with_full_name("  Ada Lovelace ");
    assert!(store.fetch_profile(&user.id).await.unwrap().is_none());

    let editor = ProfileEditor::load(store.clone(), &user)
        .await
        .expect("Failed to load profile");

    assert_eq!(editor.profile().id, user.id);
    assert_eq!(editor.display_name(), "Ada Lovelace");
    assert_eq!(editor.avatar_initial(), Some('A'));
    assert_eq!(editor.mode(), &EditMode::Viewing);
    let stored = store.fetch_profile(&user.id).await.unwrap().unwrap();
    assert_eq!(stored.full_name.as_deref(), Some("Ada Lovelace"));
}

#[tokio::test]
async fn test_existing_profile_is_not_reseeded() {
    let store = memory_store().await;
    let user = principal().with_full_name("Ada");
    store
        .insert_profile(&user.id, Some("Grace".into()))
        .await
        .unwrap();

    let editor = ProfileEditor::load(store.clone(), &user).await.unwrap();

    assert_eq!(editor.display_name(), "Grace");
}

#[tokio::test]
async fn test_nameless_profile_falls_back_to_email() {
    let store = memory_store().await;
    let user = principal().with_email("grace@example.com");

    let editor = ProfileEditor::load(store, &user).await.unwrap();

    assert_eq!(editor.display_name(), "Anonymous User");
    assert_eq!(editor.avatar_initial(), Some('G'));
}

#[tokio::test]
async fn test_commit_replaces_name_once_confirmed() {
    let store = memory_store().await;
    let user = principal().with_full_name("Ada");
    let mut editor = ProfileEditor::load(store.clone(), &user).await.unwrap();

    editor.begin_edit();
    assert_eq!(editor.draft(), Some("Ada"));
    editor.set_draft("  Ada King ").unwrap();
    editor.commit_edit().await.expect("Failed to commit");

    assert!(!editor.is_editing());
    assert_eq!(editor.display_name(), "Ada King");
    assert!(editor.last_error().is_none());
    let stored = store.fetch_profile(&user.id).await.unwrap().unwrap();
    assert_eq!(stored.full_name.as_deref(), Some("Ada King"));
}

#[tokio::test]
async fn test_blank_draft_clears_name() {
    let store = memory_store().await;
    let user = principal().with_full_name("Ada");
    let mut editor = ProfileEditor::load(store.clone(), &user).await.unwrap();

    editor.begin_edit();
    editor.set_draft("   ").unwrap();
    editor.commit_edit().await.unwrap();

    assert_eq!(editor.profile().full_name, None);
    assert_eq!(editor.display_name(), "Anonymous User");
}

#[tokio::test]
async fn test_cancel_discards_draft_without_remote_call() {
    let store = FlakyStore::new(memory_store().await);
    let user = principal().with_full_name("Ada");
    let mut editor = ProfileEditor::load(store.clone(), &user).await.unwrap();

    editor.begin_edit();
    editor.set_draft("Someone else").unwrap();
    editor.cancel_edit();

    assert_eq!(editor.mode(), &EditMode::Viewing);
    assert_eq!(editor.display_name(), "Ada");
    assert_eq!(store.calls(Op::UpdateProfile), 0);
}

#[tokio::test]
async fn test_failed_commit_keeps_draft() {
    let store = FlakyStore::new(memory_store().await);
    let user = principal().with_full_name("Ada");
    let mut editor = ProfileEditor::load(store.clone(), &user).await.unwrap();
    store.fail(Op::UpdateProfile);

    editor.begin_edit();
    editor.set_draft("Ada King").unwrap();
    let result = editor.commit_edit().await;

    assert!(matches!(result, Err(ProfileError::Remote(_))));
    assert_eq!(editor.draft(), Some("Ada King"));
    assert_eq!(editor.display_name(), "Ada");
    assert!(editor.last_error().is_some());

    // Retrying once the store recovers succeeds
    store.heal(Op::UpdateProfile);
    editor.commit_edit().await.unwrap();
    assert_eq!(editor.display_name(), "Ada King");
    assert!(editor.last_error().is_none());
}

#[tokio::test]
async fn test_editing_requires_edit_mode() {
    let store = memory_store().await;
    let mut editor = ProfileEditor::load(store, &principal()).await.unwrap();

    assert!(matches!(editor.set_draft("x"), Err(ProfileError::NotEditing)));
    assert!(matches!(editor.commit_edit().await, Err(ProfileError::NotEditing)));
}

#[tokio::test]
async fn test_empty_avatar_upload_is_rejected() {
    let store = FlakyStore::new(memory_store().await);
    let mut editor = ProfileEditor::load(store.clone(), &principal()).await.unwrap();

    let result = editor.upload_avatar(Vec::new(), "me.png").await;

    match result {
        Err(ProfileError::Validation(message)) => {
            assert_eq!(message, "You must select an image to upload.");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(store.calls(Op::UploadAvatar), 0);
}

#[tokio::test]
async fn test_avatar_upload_overwrites_and_updates_reference() {
    let inner = memory_store().await;
    let store: Arc<dyn RemoteStore> = inner.clone();
    let user = principal();
    let mut editor = ProfileEditor::load(store, &user).await.unwrap();

    let first = editor
        .upload_avatar(vec![1, 2, 3], "Me.PNG")
        .await
        .expect("Failed to upload avatar");
    assert!(first.contains(&format!("{}/avatar.png?v=", user.id)));
    assert_eq!(editor.profile().avatar_url.as_deref(), Some(first.as_str()));

    let second = editor.upload_avatar(vec![4, 5, 6], "me.png").await.unwrap();
    assert_ne!(first, second);

    let (path, bytes) = inner.fetch_avatar(&user.id).await.unwrap().unwrap();
    assert_eq!(path, format!("{}/avatar.png", user.id));
    assert_eq!(bytes, vec![4, 5, 6]);
    let stored = inner.fetch_profile(&user.id).await.unwrap().unwrap();
    assert_eq!(stored.avatar_url.as_deref(), Some(second.as_str()));
}

#[tokio::test]
async fn test_failed_avatar_reference_update_is_reported() {
    let store = FlakyStore::new(memory_store().await);
    let mut editor = ProfileEditor::load(store.clone(), &principal()).await.unwrap();
    store.fail(Op::UpdateProfile);

    let result = editor.upload_avatar(vec![1], "me.jpg").await;

    assert!(matches!(result, Err(ProfileError::Remote(_))));
    assert_eq!(editor.profile().avatar_url, None);
    assert!(editor.last_error().is_some());
}
