// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Out-of-band control of the server under test.
//!
//! Some scenarios need to change server state the protocol itself cannot
//! touch: wiping a device partnership, or granting another user access to a
//! mailbox folder. These calls bypass the protocol adapter and are only made
//! during scenario setup and teardown.

use crate::error::{BoxFuture, HarnessError};
use std::sync::Arc;
use tracing::debug;

/// Mailbox folder permission level granted to another user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderPermission {
    None,
    Reviewer,
    Editor,
    Owner,
    /// Role names the harness does not model.
    Custom(String),
}

impl FolderPermission {
    pub fn as_str(&self) -> &str {
        match self {
            FolderPermission::None => "None",
            FolderPermission::Reviewer => "Reviewer",
            FolderPermission::Editor => "Editor",
            FolderPermission::Owner => "Owner",
            FolderPermission::Custom(role) => role,
        }
    }

    pub fn parse(role: &str) -> Self {
        match role {
            "None" => FolderPermission::None,
            "Reviewer" => FolderPermission::Reviewer,
            "Editor" => FolderPermission::Editor,
            "Owner" => FolderPermission::Owner,
            other => FolderPermission::Custom(other.to_string()),
        }
    }
}

/// SUT administrative operations.
pub trait SutControl: Send + Sync + 'static {
    /// Remove the device partnership so the next exchange re-provisions.
    fn delete_device(&self, user_name: &str, device_id: &str) -> BoxFuture<'_, ()>;

    /// Current permission `delegate` holds on `owner_user`'s `folder`.
    fn mailbox_folder_permission(
        &self,
        owner_user: &str,
        folder: &str,
        delegate: &str,
    ) -> BoxFuture<'_, FolderPermission>;

    fn set_mailbox_folder_permission(
        &self,
        owner_user: &str,
        folder: &str,
        delegate: &str,
        permission: FolderPermission,
    ) -> BoxFuture<'_, ()>;
}

impl<S: SutControl> SutControl for Arc<S> {
    fn delete_device(&self, user_name: &str, device_id: &str) -> BoxFuture<'_, ()> {
        (**self).delete_device(user_name, device_id)
    }

    fn mailbox_folder_permission(
        &self,
        owner_user: &str,
        folder: &str,
        delegate: &str,
    ) -> BoxFuture<'_, FolderPermission> {
        (**self).mailbox_folder_permission(owner_user, folder, delegate)
    }

    fn set_mailbox_folder_permission(
        &self,
        owner_user: &str,
        folder: &str,
        delegate: &str,
        permission: FolderPermission,
    ) -> BoxFuture<'_, ()> {
        (**self).set_mailbox_folder_permission(owner_user, folder, delegate, permission)
    }
}

/// A no-op implementation for dry runs.
///
/// Logs operations but doesn't touch anything.
#[derive(Clone, Default)]
pub struct NoOpSutControl;

impl SutControl for NoOpSutControl {
    fn delete_device(&self, user_name: &str, device_id: &str) -> BoxFuture<'_, ()> {
        let user_name = user_name.to_string();
        let device_id = device_id.to_string();
        Box::pin(async move {
            debug!(user = %user_name, device_id = %device_id, "NoOp: would delete device");
            Ok(())
        })
    }

    fn mailbox_folder_permission(
        &self,
        owner_user: &str,
        folder: &str,
        delegate: &str,
    ) -> BoxFuture<'_, FolderPermission> {
        let owner_user = owner_user.to_string();
        let folder = folder.to_string();
        let delegate = delegate.to_string();
        Box::pin(async move {
            debug!(
                owner = %owner_user,
                folder = %folder,
                delegate = %delegate,
                "NoOp: folder permission lookup (returning None)"
            );
            Ok(FolderPermission::None)
        })
    }

    fn set_mailbox_folder_permission(
        &self,
        owner_user: &str,
        folder: &str,
        delegate: &str,
        permission: FolderPermission,
    ) -> BoxFuture<'_, ()> {
        let owner_user = owner_user.to_string();
        let folder = folder.to_string();
        let delegate = delegate.to_string();
        Box::pin(async move {
            if owner_user.is_empty() || delegate.is_empty() {
                return Err(HarnessError::sut(
                    "set_mailbox_folder_permission",
                    "owner and delegate must be named",
                ));
            }
            debug!(
                owner = %owner_user,
                folder = %folder,
                delegate = %delegate,
                permission = permission.as_str(),
                "NoOp: would set folder permission"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_delete_device() {
        let sut = NoOpSutControl;
        assert!(sut.delete_device("user1", "DEVICE1").await.is_ok());
    }

    #[tokio::test]
    async fn test_noop_permission_lookup_is_none() {
        let sut = NoOpSutControl;
        let permission = sut
            .mailbox_folder_permission("user1", "Calendar", "user2")
            .await
            .unwrap();
        assert_eq!(permission, FolderPermission::None);
    }

    #[tokio::test]
    async fn test_noop_set_permission_requires_names() {
        let sut = NoOpSutControl;
        assert!(sut
            .set_mailbox_folder_permission("user1", "Calendar", "user2", FolderPermission::Editor)
            .await
            .is_ok());
        let err = sut
            .set_mailbox_folder_permission("", "Calendar", "user2", FolderPermission::Editor)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("set_mailbox_folder_permission"));
    }

    #[test]
    fn test_permission_parse_round_trip() {
        for role in ["None", "Reviewer", "Editor", "Owner", "PublishingAuthor"] {
            assert_eq!(FolderPermission::parse(role).as_str(), role);
        }
    }
}
