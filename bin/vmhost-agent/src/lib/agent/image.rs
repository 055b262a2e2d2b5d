// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Root image and user data replacement, patching and debugging.
//!
//! Replacing or patching the root image (or replacing user data) keeps the
//! previous contents as a backup unless the caller opts out. The backup can
//! be swapped back in with a restore, or discarded once the caller is
//! satisfied with the change.

use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use slog::{error, info, warn};
use tokio::io::AsyncReadExt;
use vmhost_api_types::{
    DebugVmImageRequest, GetVmUserDataRequest, GetVmUserDataResponse,
    ImageProgressResponse, PatchLog, PatchVmImageRequest,
    ReplaceVmImageRequest, ReplaceVmUserDataRequest, VmInfo, VmState,
};

use super::{Agent, Caller};
use crate::engine::EngineError;
use crate::error::AgentError;
use crate::lock::LockMode;
use crate::storage::{Blob, StorageError};
use crate::stream::{Conversation, StreamConn};
use crate::vm::transition::Trigger;
use crate::vm::OperationGuard;

impl Agent {
    /// Checks ownership and marks the VM busy with `op`.
    async fn begin_image_op(
        &self,
        caller: &Caller,
        addr: IpAddr,
        op: &'static str,
        allowed: &[VmState],
    ) -> Result<(VmInfo, OperationGuard), AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        let info = self.vm_in(addr, allowed)?;
        self.check_owner(caller, &info)?;
        let guard = self.registry.begin_operation(addr, op, allowed)?;
        Ok((info, guard))
    }

    /// Moves `blob` aside as `backup`, or drops it when no backup is wanted.
    /// Returns whether a backup now exists.
    async fn set_aside(
        &self,
        addr: IpAddr,
        blob: &Blob,
        backup: &Blob,
        keep: bool,
    ) -> Result<bool, AgentError> {
        if !self.storage.exists(addr, blob).await {
            return Ok(false);
        }
        if keep {
            self.storage.rename(addr, blob, backup).await?;
        } else {
            self.storage.remove(addr, blob).await?;
        }
        Ok(keep)
    }

    /// Puts a backup made by [`Agent::set_aside`] back after a failure.
    async fn put_back(
        &self,
        addr: IpAddr,
        blob: &Blob,
        backup: &Blob,
        backed_up: bool,
    ) {
        let restored = if backed_up {
            self.storage.rename(addr, backup, blob).await
        } else {
            self.storage.remove(addr, blob).await
        };
        if let Err(e) = restored {
            warn!(self.log, "could not put back previous contents";
                  "vm" => %addr, "blob" => ?blob, "error" => %e);
        }
    }

    /// Replaces the root image of a stopped VM with one streamed by the
    /// caller, then starts the VM.
    pub async fn replace_vm_image<S: StreamConn>(
        &self,
        caller: &Caller,
        addr: IpAddr,
        conv: &mut Conversation<S>,
    ) -> Result<ImageProgressResponse, AgentError> {
        let req: ReplaceVmImageRequest = conv.recv().await?;
        if req.image_data_size == 0 {
            return Err(AgentError::InvalidArgument(
                "no image supplied".to_string(),
            ));
        }
        let (_, op) = self
            .begin_image_op(caller, addr, "replace image", &[VmState::Stopped])
            .await?;
        self.storage
            .capacity()
            .await?
            .check(req.image_data_size, req.minimum_free_bytes)?;

        let root = Blob::Volume(0);
        let backed_up = self
            .set_aside(addr, &root, &Blob::RootBackup, !req.skip_backup)
            .await?;
        conv.progress::<ImageProgressResponse>(format!(
            "receiving {} byte image",
            req.image_data_size
        ))
        .await?;
        let received =
            self.receive_blob(conv, addr, &root, req.image_data_size).await;
        if let Err(e) = received {
            self.put_back(addr, &root, &Blob::RootBackup, backed_up).await;
            return Err(e);
        }
        op.update(|vm| {
            if let Some(root) = vm.volumes.first_mut() {
                root.size = req.image_data_size;
            }
            vm.last_patch = None;
            Ok::<_, AgentError>(())
        })?;
        drop(op);
        info!(self.log, "root image replaced";
              "vm" => %addr, "backup" => backed_up);

        conv.progress::<ImageProgressResponse>("starting VM").await?;
        {
            let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
            self.registry.apply_transition(addr, Trigger::StartRequested)?;
        }
        let dhcp_timed_out =
            self.boot_vm(addr, req.dhcp_timeout_ms, false).await?;
        Ok(ImageProgressResponse {
            dhcp_timed_out,
            progress_message: "image replaced".to_string(),
            ..Default::default()
        })
    }

    /// Patches the root image of a stopped VM in place, relaying the patch
    /// log as progress. The log is kept on the VM.
    pub async fn patch_vm_image<S: StreamConn>(
        &self,
        caller: &Caller,
        addr: IpAddr,
        conv: &mut Conversation<S>,
    ) -> Result<ImageProgressResponse, AgentError> {
        let req: PatchVmImageRequest = conv.recv().await?;
        if req.image_name.is_empty() {
            return Err(AgentError::InvalidArgument(
                "no image name given".to_string(),
            ));
        }
        let (_, op) = self
            .begin_image_op(caller, addr, "patch image", &[VmState::Stopped])
            .await?;

        let root = Blob::Volume(0);
        if !req.skip_backup {
            conv.progress::<ImageProgressResponse>("backing up root image")
                .await?;
            self.storage.copy(addr, &root, &Blob::RootBackup).await?;
        }
        conv.progress::<ImageProgressResponse>(format!(
            "applying {}",
            req.image_name
        ))
        .await?;
        let path = self.storage.location(addr, &root);
        let patched = match req.image_timeout_ms {
            0 => self.engine.patch_root(&path, &req.image_name).await,
            ms => tokio::time::timeout(
                Duration::from_millis(ms),
                self.engine.patch_root(&path, &req.image_name),
            )
            .await
            .unwrap_or_else(|_| {
                Err(EngineError::Patch(format!(
                    "{} timed out after {ms} ms",
                    req.image_name
                )))
            }),
        };
        let lines = match patched {
            Ok(lines) => lines,
            Err(e) => {
                if !req.skip_backup {
                    let restored = self
                        .storage
                        .copy(addr, &Blob::RootBackup, &root)
                        .await;
                    if let Err(e) = restored {
                        warn!(self.log, "could not restore root image";
                              "vm" => %addr, "error" => %e);
                    }
                }
                return Err(e.into());
            }
        };
        for line in lines.iter() {
            conv.progress::<ImageProgressResponse>(line.clone()).await?;
        }
        let size = self.storage.size(addr, &root).await?;
        op.update(|vm| {
            if let Some(root) = vm.volumes.first_mut() {
                root.size = size;
            }
            vm.image_name = req.image_name.clone();
            vm.last_patch = Some(PatchLog { patched_on: Utc::now(), lines });
            Ok::<_, AgentError>(())
        })?;
        info!(self.log, "root image patched";
              "vm" => %addr, "image" => &req.image_name);
        Ok(ImageProgressResponse {
            progress_message: "image patched".to_string(),
            ..Default::default()
        })
    }

    /// Boots a running VM from a streamed debug image, leaving its real root
    /// image alone. [`Agent::end_vm_debug`] boots it normally again.
    pub async fn debug_vm_image<S: StreamConn>(
        &self,
        caller: &Caller,
        addr: IpAddr,
        conv: &mut Conversation<S>,
    ) -> Result<ImageProgressResponse, AgentError> {
        let req: DebugVmImageRequest = conv.recv().await?;
        if req.image_data_size == 0 {
            return Err(AgentError::InvalidArgument(
                "no image supplied".to_string(),
            ));
        }
        let (_, op) = self
            .begin_image_op(
                caller,
                addr,
                "load debug image",
                &[VmState::Running],
            )
            .await?;
        self.storage
            .capacity()
            .await?
            .check(req.image_data_size, req.minimum_free_bytes)?;
        conv.progress::<ImageProgressResponse>(format!(
            "receiving {} byte debug image",
            req.image_data_size
        ))
        .await?;
        let received = self
            .receive_blob(conv, addr, &Blob::DebugImage, req.image_data_size)
            .await;
        if let Err(e) = received {
            self.remove_blob_logged(addr, &Blob::DebugImage).await;
            return Err(e);
        }
        drop(op);

        conv.progress::<ImageProgressResponse>("booting debug image").await?;
        {
            let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
            self.registry.apply_transition(addr, Trigger::DebugRequested)?;
        }
        match self.engine.stop(addr).await {
            Ok(()) | Err(EngineError::NotRunning(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let dhcp_timed_out =
            self.boot_vm(addr, req.dhcp_timeout_ms, true).await?;
        Ok(ImageProgressResponse {
            dhcp_timed_out,
            progress_message: "debug image booted".to_string(),
            ..Default::default()
        })
    }

    /// Boots a debugging VM from its real root image again.
    pub async fn end_vm_debug(
        &self,
        caller: &Caller,
        addr: IpAddr,
    ) -> Result<(), AgentError> {
        let info = {
            let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
            let info = self.vm_in(addr, &[VmState::Debugging])?;
            self.check_owner(caller, &info)?;
            self.registry.apply_transition(addr, Trigger::DebugEnded)?;
            info
        };
        match self.engine.stop(addr).await {
            Ok(()) | Err(EngineError::NotRunning(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.remove_blob_logged(addr, &Blob::DebugImage).await;
        let spec = self.boot_spec(&info, false).await;
        if let Err(e) = self.engine.boot(spec).await {
            error!(self.log, "could not boot root image";
                   "vm" => %addr, "error" => %e);
            self.registry.apply_transition(addr, Trigger::HealthCheckFailed)?;
            return Err(e.into());
        }
        info!(self.log, "VM back on its own root image"; "vm" => %addr);
        Ok(())
    }

    /// Replaces a VM's user data with bytes streamed by the caller. The
    /// guest sees the change on its next boot.
    pub async fn replace_vm_user_data<S: StreamConn>(
        &self,
        caller: &Caller,
        addr: IpAddr,
        conv: &mut Conversation<S>,
    ) -> Result<ImageProgressResponse, AgentError> {
        let req: ReplaceVmUserDataRequest = conv.recv().await?;
        let (_, _op) = self
            .begin_image_op(
                caller,
                addr,
                "replace user data",
                &[VmState::Stopped, VmState::Running],
            )
            .await?;
        self.storage.capacity().await?.check(req.size, 0)?;

        let data = Blob::UserData;
        let backed_up = self
            .set_aside(addr, &data, &Blob::UserDataBackup, true)
            .await?;
        if let Err(e) = self.receive_blob(conv, addr, &data, req.size).await {
            self.put_back(addr, &data, &Blob::UserDataBackup, backed_up).await;
            return Err(e);
        }
        info!(self.log, "user data replaced";
              "vm" => %addr, "bytes" => req.size);
        Ok(ImageProgressResponse {
            progress_message: "user data replaced".to_string(),
            ..Default::default()
        })
    }

    pub async fn discard_vm_old_image(
        &self,
        caller: &Caller,
        addr: IpAddr,
    ) -> Result<(), AgentError> {
        self.discard_backup(caller, addr, Blob::RootBackup).await
    }

    pub async fn discard_vm_old_user_data(
        &self,
        caller: &Caller,
        addr: IpAddr,
    ) -> Result<(), AgentError> {
        self.discard_backup(caller, addr, Blob::UserDataBackup).await
    }

    async fn discard_backup(
        &self,
        caller: &Caller,
        addr: IpAddr,
        backup: Blob,
    ) -> Result<(), AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Exclusive).await?;
        let entry = self.registry.lookup(addr)?;
        self.check_owner(caller, &entry.info)?;
        if !self.storage.exists(addr, &backup).await {
            return Err(StorageError::NotFound(format!(
                "{backup:?} of VM {addr}"
            ))
            .into());
        }
        self.storage.remove(addr, &backup).await?;
        Ok(())
    }

    /// Swaps the root image backup back into place on a stopped VM.
    pub async fn restore_vm_image(
        &self,
        caller: &Caller,
        addr: IpAddr,
    ) -> Result<(), AgentError> {
        let (_, op) = self
            .begin_image_op(caller, addr, "restore image", &[VmState::Stopped])
            .await?;
        self.storage.rename(addr, &Blob::RootBackup, &Blob::Volume(0)).await?;
        let size = self.storage.size(addr, &Blob::Volume(0)).await?;
        op.update(|vm| {
            if let Some(root) = vm.volumes.first_mut() {
                root.size = size;
            }
            vm.last_patch = None;
            Ok::<_, AgentError>(())
        })
    }

    pub async fn restore_vm_user_data(
        &self,
        caller: &Caller,
        addr: IpAddr,
    ) -> Result<(), AgentError> {
        let (_, _op) = self
            .begin_image_op(
                caller,
                addr,
                "restore user data",
                &[VmState::Stopped],
            )
            .await?;
        self.storage
            .rename(addr, &Blob::UserDataBackup, &Blob::UserData)
            .await?;
        Ok(())
    }

    pub async fn get_vm_user_data(
        &self,
        caller: &Caller,
        addr: IpAddr,
        req: &GetVmUserDataRequest,
    ) -> Result<GetVmUserDataResponse, AgentError> {
        let _locks = self.vm_locks(addr, LockMode::Shared).await?;
        self.registry.lookup(addr)?;
        self.check_token(caller, addr, req.access_token.as_deref())?;
        let mut data = Vec::new();
        let mut reader = self.storage.open(addr, &Blob::UserData).await?;
        reader.read_to_end(&mut data).await.map_err(StorageError::from)?;
        Ok(GetVmUserDataResponse { data })
    }
}
