// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP server callback functions.
//!
//! Handlers here only decode paths and bodies, establish the caller from the
//! request headers, and hand the work to the [`Agent`]. Errors are mapped to
//! HTTP status codes by `From<AgentError> for HttpError`.
//!
//! Operations that stream (create, migrate, copy, image uploads, watchers,
//! held locks and guest channels) are websocket channels: the first text
//! frame from the client is the request, progress and results come back as
//! text frames, and bulk data travels in binary frames.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use dropshot::{
    channel, endpoint, ApiDescription, Body, ConfigDropshot, HandlerTaskMode,
    HttpError, HttpResponseOk, HttpResponseUpdatedNoContent, HttpServer,
    HttpServerStarter, Path, RequestContext, TypedBody, WebsocketChannelResult,
    WebsocketConnection, WebsocketConnectionRaw,
};
use http::{header, Response, StatusCode};
use slog::{info, warn, Logger};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use vmhost_api_types::*;

use crate::agent::{Agent, Caller};
use crate::engine::Channel;
use crate::stream::Conversation;

type AgentContext = Arc<Agent>;

fn caller(rqctx: &RequestContext<AgentContext>) -> Caller {
    Caller::from_headers(rqctx.request.headers())
}

async fn conversation(
    websock: WebsocketConnection,
) -> Conversation<WebsocketConnectionRaw> {
    Conversation::new(
        WebSocketStream::from_raw_socket(
            websock.into_inner(),
            Role::Server,
            None,
        )
        .await,
    )
}

// Lifecycle

#[channel {
    protocol = WEBSOCKETS,
    path = "/vms/create",
}]
async fn vm_create(
    rqctx: RequestContext<AgentContext>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let caller = caller(&rqctx);
    let mut conv = conversation(websock).await;
    let result = rqctx
        .context()
        .create_vm(&caller, &mut conv)
        .await
        .map(CreateVmResponse::from);
    conv.finish(result).await?;
    conv.close().await;
    Ok(())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/start",
}]
async fn vm_start(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<StartVmRequest>,
) -> Result<HttpResponseOk<StartVmResponse>, HttpError> {
    let addr = path.into_inner().ip_address;
    let resp = rqctx
        .context()
        .start_vm(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseOk(resp))
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/stop",
}]
async fn vm_stop(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<StopVmRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .stop_vm(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/reboot",
}]
async fn vm_reboot(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<RebootVmRequest>,
) -> Result<HttpResponseOk<RebootVmResponse>, HttpError> {
    let addr = path.into_inner().ip_address;
    let resp = rqctx
        .context()
        .reboot_vm(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseOk(resp))
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/destroy",
}]
async fn vm_destroy(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<DestroyVmRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .destroy_vm(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vms/import-local",
}]
async fn vm_import_local(
    rqctx: RequestContext<AgentContext>,
    request: TypedBody<ImportLocalVmRequest>,
) -> Result<HttpResponseOk<VmPathParams>, HttpError> {
    let ip_address = rqctx
        .context()
        .import_local_vm(&caller(&rqctx), &request.into_inner())
        .await?;
    Ok(HttpResponseOk(VmPathParams { ip_address }))
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/commit-imported",
}]
async fn vm_commit_imported(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx.context().commit_imported_vm(&caller(&rqctx), addr).await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/export-local",
}]
async fn vm_export_local(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseOk<ExportLocalVmInfo>, HttpError> {
    let addr = path.into_inner().ip_address;
    let info = rqctx.context().export_local_vm(&caller(&rqctx), addr).await?;
    Ok(HttpResponseOk(info))
}

// Migration

#[channel {
    protocol = WEBSOCKETS,
    path = "/vms/migrate",
}]
async fn vm_migrate(
    rqctx: RequestContext<AgentContext>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let caller = caller(&rqctx);
    let mut conv = conversation(websock).await;
    let result = rqctx.context().migrate_vm(&caller, &mut conv).await;
    conv.finish(result).await?;
    conv.close().await;
    Ok(())
}

#[channel {
    protocol = WEBSOCKETS,
    path = "/vms/copy",
}]
async fn vm_copy(
    rqctx: RequestContext<AgentContext>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let caller = caller(&rqctx);
    let mut conv = conversation(websock).await;
    let result = rqctx.context().copy_vm(&caller, &mut conv).await;
    conv.finish(result).await?;
    conv.close().await;
    Ok(())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/prepare-for-migration",
}]
async fn vm_prepare_for_migration(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<PrepareVmForMigrationRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .prepare_vm_for_migration(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/migration/resolve",
}]
async fn vm_resolve_migration(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ResolveVmMigrationRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .resolve_vm_migration(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

// This channel is dialed by a destination agent during a migration or copy.
// It is not part of the client-facing API.
#[channel {
    protocol = WEBSOCKETS,
    path = "/migrate/{ip_address}/source",
    unpublished = true,
}]
async fn vm_migrate_source(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let addr = path.into_inner().ip_address;
    let conn = WebSocketStream::from_raw_socket(
        websock.into_inner(),
        Role::Server,
        None,
    )
    .await;
    crate::migrate::source::serve(rqctx.context(), addr, conn).await?;
    Ok(())
}

// Descriptor changes

#[endpoint {
    method = PUT,
    path = "/host/owners",
}]
async fn host_change_owners(
    rqctx: RequestContext<AgentContext>,
    request: TypedBody<ChangeOwnersRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    rqctx
        .context()
        .change_owners(&caller(&rqctx), &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/owner-users",
}]
async fn vm_change_owner_users(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ChangeVmOwnerUsersRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .change_vm_owner_users(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/owner-groups",
}]
async fn vm_change_owner_groups(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ChangeVmOwnerGroupsRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .change_vm_owner_groups(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/tags",
}]
async fn vm_change_tags(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ChangeVmTagsRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .change_vm_tags(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/cpu-priority",
}]
async fn vm_change_cpu_priority(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ChangeVmCpuPriorityRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .change_vm_cpu_priority(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/size",
}]
async fn vm_change_size(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ChangeVmSizeRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .change_vm_size(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/subnet",
}]
async fn vm_change_subnet(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ChangeVmSubnetRequest>,
) -> Result<HttpResponseOk<ChangeVmSubnetResponse>, HttpError> {
    let addr = path.into_inner().ip_address;
    let resp = rqctx
        .context()
        .change_vm_subnet(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseOk(resp))
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/console-type",
}]
async fn vm_change_console_type(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ChangeVmConsoleTypeRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .change_vm_console_type(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/destroy-protection",
}]
async fn vm_change_destroy_protection(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ChangeVmDestroyProtectionRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .change_vm_destroy_protection(
            &caller(&rqctx),
            addr,
            &request.into_inner(),
        )
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/machine-type",
}]
async fn vm_change_machine_type(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ChangeVmMachineTypeRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .change_vm_machine_type(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/watchdog",
}]
async fn vm_change_watchdog(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ChangeVmWatchdogRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .change_vm_watchdog(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

// Volumes and snapshots

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/volume-interfaces",
}]
async fn vm_change_volume_interfaces(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ChangeVmVolumeInterfacesRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .change_vm_volume_interfaces(
            &caller(&rqctx),
            addr,
            &request.into_inner(),
        )
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/volumes/{volume_index}/size",
}]
async fn vm_change_volume_size(
    rqctx: RequestContext<AgentContext>,
    path: Path<VolumePathParams>,
    request: TypedBody<ChangeVmVolumeSizeRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let VolumePathParams { ip_address, volume_index } = path.into_inner();
    rqctx
        .context()
        .change_vm_volume_size(
            &caller(&rqctx),
            ip_address,
            volume_index,
            &request.into_inner(),
        )
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/volume-order",
}]
async fn vm_reorder_volumes(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ReorderVmVolumesRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .reorder_vm_volumes(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = POST,
    path = "/vm/{ip_address}/volumes",
}]
async fn vm_add_volumes(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<AddVmVolumesRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .add_vm_volumes(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/volumes/{volume_index}/delete",
}]
async fn vm_delete_volume(
    rqctx: RequestContext<AgentContext>,
    path: Path<VolumePathParams>,
    request: TypedBody<DeleteVmVolumeRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let VolumePathParams { ip_address, volume_index } = path.into_inner();
    rqctx
        .context()
        .delete_vm_volume(
            &caller(&rqctx),
            ip_address,
            volume_index,
            &request.into_inner(),
        )
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = POST,
    path = "/vm/{ip_address}/snapshots",
}]
async fn vm_snapshot(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<SnapshotVmRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .snapshot_vm(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/snapshots/{name}/restore",
}]
async fn vm_restore_from_snapshot(
    rqctx: RequestContext<AgentContext>,
    path: Path<SnapshotPathParams>,
    request: TypedBody<RestoreVmFromSnapshotRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let SnapshotPathParams { ip_address, name } = path.into_inner();
    rqctx
        .context()
        .restore_vm_from_snapshot(
            &caller(&rqctx),
            ip_address,
            &name,
            &request.into_inner(),
        )
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = DELETE,
    path = "/vm/{ip_address}/snapshots/{name}",
}]
async fn vm_discard_snapshot(
    rqctx: RequestContext<AgentContext>,
    path: Path<SnapshotPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let SnapshotPathParams { ip_address, name } = path.into_inner();
    rqctx
        .context()
        .discard_vm_snapshot(&caller(&rqctx), ip_address, &name)
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

// Images and user data

#[channel {
    protocol = WEBSOCKETS,
    path = "/vm/{ip_address}/image/replace",
}]
async fn vm_replace_image(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let addr = path.into_inner().ip_address;
    let caller = caller(&rqctx);
    let mut conv = conversation(websock).await;
    let result =
        rqctx.context().replace_vm_image(&caller, addr, &mut conv).await;
    conv.finish(result).await?;
    conv.close().await;
    Ok(())
}

#[channel {
    protocol = WEBSOCKETS,
    path = "/vm/{ip_address}/image/patch",
}]
async fn vm_patch_image(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let addr = path.into_inner().ip_address;
    let caller = caller(&rqctx);
    let mut conv = conversation(websock).await;
    let result = rqctx.context().patch_vm_image(&caller, addr, &mut conv).await;
    conv.finish(result).await?;
    conv.close().await;
    Ok(())
}

#[channel {
    protocol = WEBSOCKETS,
    path = "/vm/{ip_address}/image/debug",
}]
async fn vm_debug_image(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let addr = path.into_inner().ip_address;
    let caller = caller(&rqctx);
    let mut conv = conversation(websock).await;
    let result = rqctx.context().debug_vm_image(&caller, addr, &mut conv).await;
    conv.finish(result).await?;
    conv.close().await;
    Ok(())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/image/end-debug",
}]
async fn vm_end_debug(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx.context().end_vm_debug(&caller(&rqctx), addr).await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/image/discard-old",
}]
async fn vm_discard_old_image(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx.context().discard_vm_old_image(&caller(&rqctx), addr).await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/image/restore",
}]
async fn vm_restore_image(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx.context().restore_vm_image(&caller(&rqctx), addr).await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[channel {
    protocol = WEBSOCKETS,
    path = "/vm/{ip_address}/user-data/replace",
}]
async fn vm_replace_user_data(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let addr = path.into_inner().ip_address;
    let caller = caller(&rqctx);
    let mut conv = conversation(websock).await;
    let result =
        rqctx.context().replace_vm_user_data(&caller, addr, &mut conv).await;
    conv.finish(result).await?;
    conv.close().await;
    Ok(())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/user-data/discard-old",
}]
async fn vm_discard_old_user_data(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx.context().discard_vm_old_user_data(&caller(&rqctx), addr).await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/user-data/restore",
}]
async fn vm_restore_user_data(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx.context().restore_vm_user_data(&caller(&rqctx), addr).await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/user-data",
}]
async fn vm_get_user_data(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<GetVmUserDataRequest>,
) -> Result<HttpResponseOk<GetVmUserDataResponse>, HttpError> {
    let addr = path.into_inner().ip_address;
    let resp = rqctx
        .context()
        .get_vm_user_data(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseOk(resp))
}

// Credentials and locks

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/access-token",
}]
async fn vm_get_access_token(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<GetVmAccessTokenRequest>,
) -> Result<HttpResponseOk<GetVmAccessTokenResponse>, HttpError> {
    let addr = path.into_inner().ip_address;
    let resp = rqctx
        .context()
        .get_vm_access_token(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseOk(resp))
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/access-token/discard",
}]
async fn vm_discard_access_token(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<DiscardVmAccessTokenRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .discard_vm_access_token(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[channel {
    protocol = WEBSOCKETS,
    path = "/host/lock",
}]
async fn host_hold_lock(
    rqctx: RequestContext<AgentContext>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let caller = caller(&rqctx);
    let mut conv = conversation(websock).await;
    let result = rqctx.context().hold_host_lock(&caller, &mut conv).await;
    // The holder may already be gone.
    let _ = conv.finish(result).await;
    conv.close().await;
    Ok(())
}

#[channel {
    protocol = WEBSOCKETS,
    path = "/vm/{ip_address}/lock",
}]
async fn vm_hold_lock(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let addr = path.into_inner().ip_address;
    let caller = caller(&rqctx);
    let mut conv = conversation(websock).await;
    let result = rqctx.context().hold_vm_lock(&caller, addr, &mut conv).await;
    let _ = conv.finish(result).await;
    conv.close().await;
    Ok(())
}

// Networking

#[endpoint {
    method = PUT,
    path = "/host/address-pool",
}]
async fn host_change_address_pool(
    rqctx: RequestContext<AgentContext>,
    request: TypedBody<ChangeAddressPoolRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    rqctx
        .context()
        .change_address_pool(&caller(&rqctx), &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/host/external-leases",
}]
async fn host_register_external_leases(
    rqctx: RequestContext<AgentContext>,
    request: TypedBody<RegisterExternalLeasesRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    rqctx
        .context()
        .register_external_leases(&caller(&rqctx), &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/host/subnets/list",
}]
async fn host_list_subnets(
    rqctx: RequestContext<AgentContext>,
    request: TypedBody<ListSubnetsRequest>,
) -> Result<HttpResponseOk<ListSubnetsResponse>, HttpError> {
    let resp = rqctx.context().list_subnets(&request.into_inner()).await?;
    Ok(HttpResponseOk(resp))
}

#[endpoint {
    method = PUT,
    path = "/host/subnets",
}]
async fn host_update_subnets(
    rqctx: RequestContext<AgentContext>,
    request: TypedBody<UpdateSubnetsRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    rqctx
        .context()
        .update_subnets(&caller(&rqctx), &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

#[endpoint {
    method = PUT,
    path = "/host/netboot",
}]
async fn host_netboot_machine(
    rqctx: RequestContext<AgentContext>,
    request: TypedBody<NetbootMachineRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    rqctx
        .context()
        .netboot_machine(&caller(&rqctx), &request.into_inner())
        .await?;
    Ok(HttpResponseUpdatedNoContent())
}

/// Serves a file offered to a netbooting machine.
#[endpoint {
    method = GET,
    path = "/netboot/{mac_address}/{name}",
}]
async fn netboot_file(
    rqctx: RequestContext<AgentContext>,
    path: Path<NetbootFilePathParams>,
) -> Result<Response<Body>, HttpError> {
    let NetbootFilePathParams { mac_address, name } = path.into_inner();
    let data = rqctx.context().netboot_file(&mac_address, &name)?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(data))
        .map_err(|e| HttpError::for_internal_error(e.to_string()))
}

#[channel {
    protocol = WEBSOCKETS,
    path = "/host/dhcp/watch",
}]
async fn host_watch_dhcp(
    rqctx: RequestContext<AgentContext>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let caller = caller(&rqctx);
    let mut conv = conversation(websock).await;
    if let Err(e) = rqctx.context().watch_dhcp(&caller, &mut conv).await {
        let _ = conv
            .send(&WatchDhcpResponse {
                error: Some(e.to_string()),
                ..Default::default()
            })
            .await;
    }
    conv.close().await;
    Ok(())
}

/// Feeds a DHCP packet seen by the host's packet capture.
#[endpoint {
    method = POST,
    path = "/host/dhcp/packets",
    unpublished = true,
}]
async fn host_observe_dhcp_packet(
    rqctx: RequestContext<AgentContext>,
    request: TypedBody<ObserveDhcpPacketRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ObserveDhcpPacketRequest { interface, packet } = request.into_inner();
    rqctx.context().observe_dhcp_packet(&interface, packet);
    Ok(HttpResponseUpdatedNoContent())
}

/// Feeds one guest request seen by the metadata service.
#[endpoint {
    method = POST,
    path = "/vm/{ip_address}/metadata-accesses",
    unpublished = true,
}]
async fn vm_record_metadata_access(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<RecordMetadataAccessRequest>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let addr = path.into_inner().ip_address;
    rqctx
        .context()
        .record_metadata_access(addr, &request.into_inner().path);
    Ok(HttpResponseUpdatedNoContent())
}

// Introspection

#[endpoint {
    method = GET,
    path = "/vm/{ip_address}",
}]
async fn vm_get_info(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
) -> Result<HttpResponseOk<VmInfo>, HttpError> {
    let addr = path.into_inner().ip_address;
    Ok(HttpResponseOk(rqctx.context().get_vm_info(addr).await?))
}

#[endpoint {
    method = PUT,
    path = "/vms/infos",
}]
async fn vms_get_infos(
    rqctx: RequestContext<AgentContext>,
    request: TypedBody<GetVmInfosRequest>,
) -> Result<HttpResponseOk<GetVmInfosResponse>, HttpError> {
    let resp = rqctx.context().get_vm_infos(&request.into_inner()).await?;
    Ok(HttpResponseOk(resp))
}

#[endpoint {
    method = PUT,
    path = "/vms/list",
}]
async fn vms_list(
    rqctx: RequestContext<AgentContext>,
    request: TypedBody<ListVMsRequest>,
) -> Result<HttpResponseOk<ListVMsResponse>, HttpError> {
    let resp = rqctx.context().list_vms(&request.into_inner()).await?;
    Ok(HttpResponseOk(resp))
}

#[endpoint {
    method = GET,
    path = "/host/capacity",
}]
async fn host_capacity(
    rqctx: RequestContext<AgentContext>,
) -> Result<HttpResponseOk<GetCapacityResponse>, HttpError> {
    Ok(HttpResponseOk(rqctx.context().capacity()))
}

#[channel {
    protocol = WEBSOCKETS,
    path = "/host/updates",
}]
async fn host_updates(
    rqctx: RequestContext<AgentContext>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let caller = caller(&rqctx);
    let mut conv = conversation(websock).await;
    let result = rqctx.context().get_updates(&caller, &mut conv).await;
    conv.close().await;
    result?;
    Ok(())
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/scan-root",
}]
async fn vm_scan_root(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ScanVmRootRequest>,
) -> Result<HttpResponseOk<ScanVmRootResponse>, HttpError> {
    let addr = path.into_inner().ip_address;
    let resp = rqctx
        .context()
        .scan_vm_root(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseOk(resp))
}

#[endpoint {
    method = PUT,
    path = "/vm/{ip_address}/probe-port",
}]
async fn vm_probe_port(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    request: TypedBody<ProbeVmPortRequest>,
) -> Result<HttpResponseOk<ProbeVmPortResponse>, HttpError> {
    let addr = path.into_inner().ip_address;
    let resp = rqctx
        .context()
        .probe_vm_port(&caller(&rqctx), addr, &request.into_inner())
        .await?;
    Ok(HttpResponseOk(resp))
}

#[channel {
    protocol = WEBSOCKETS,
    path = "/vm/{ip_address}/metadata-trace",
}]
async fn vm_trace_metadata(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let addr = path.into_inner().ip_address;
    let caller = caller(&rqctx);
    let mut conv = conversation(websock).await;
    let result =
        rqctx.context().trace_vm_metadata(&caller, addr, &mut conv).await;
    conv.close().await;
    result?;
    Ok(())
}

// Guest channels

#[channel {
    protocol = WEBSOCKETS,
    path = "/vm/{ip_address}/console",
}]
async fn vm_console(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let addr = path.into_inner().ip_address;
    let conv = conversation(websock).await;
    rqctx
        .context()
        .serve_channel(&caller(&rqctx), addr, Channel::Console, conv)
        .await?;
    Ok(())
}

#[channel {
    protocol = WEBSOCKETS,
    path = "/vm/{ip_address}/manager",
}]
async fn vm_manager(
    rqctx: RequestContext<AgentContext>,
    path: Path<VmPathParams>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let addr = path.into_inner().ip_address;
    let conv = conversation(websock).await;
    rqctx
        .context()
        .serve_channel(&caller(&rqctx), addr, Channel::Manager, conv)
        .await?;
    Ok(())
}

#[channel {
    protocol = WEBSOCKETS,
    path = "/vm/{ip_address}/serial/{port_number}",
}]
async fn vm_serial_port(
    rqctx: RequestContext<AgentContext>,
    path: Path<SerialPortPathParams>,
    websock: WebsocketConnection,
) -> WebsocketChannelResult {
    let SerialPortPathParams { ip_address, port_number } = path.into_inner();
    let conv = conversation(websock).await;
    rqctx
        .context()
        .serve_channel(
            &caller(&rqctx),
            ip_address,
            Channel::Serial(port_number),
            conv,
        )
        .await?;
    Ok(())
}

/// Returns a Dropshot [`ApiDescription`] object to launch a server.
pub fn api() -> ApiDescription<AgentContext> {
    let mut api = ApiDescription::new();
    api.register(vm_create).unwrap();
    api.register(vm_start).unwrap();
    api.register(vm_stop).unwrap();
    api.register(vm_reboot).unwrap();
    api.register(vm_destroy).unwrap();
    api.register(vm_import_local).unwrap();
    api.register(vm_commit_imported).unwrap();
    api.register(vm_export_local).unwrap();

    api.register(vm_migrate).unwrap();
    api.register(vm_copy).unwrap();
    api.register(vm_prepare_for_migration).unwrap();
    api.register(vm_resolve_migration).unwrap();
    api.register(vm_migrate_source).unwrap();

    api.register(host_change_owners).unwrap();
    api.register(vm_change_owner_users).unwrap();
    api.register(vm_change_owner_groups).unwrap();
    api.register(vm_change_tags).unwrap();
    api.register(vm_change_cpu_priority).unwrap();
    api.register(vm_change_size).unwrap();
    api.register(vm_change_subnet).unwrap();
    api.register(vm_change_console_type).unwrap();
    api.register(vm_change_destroy_protection).unwrap();
    api.register(vm_change_machine_type).unwrap();
    api.register(vm_change_watchdog).unwrap();

    api.register(vm_change_volume_interfaces).unwrap();
    api.register(vm_change_volume_size).unwrap();
    api.register(vm_reorder_volumes).unwrap();
    api.register(vm_add_volumes).unwrap();
    api.register(vm_delete_volume).unwrap();
    api.register(vm_snapshot).unwrap();
    api.register(vm_restore_from_snapshot).unwrap();
    api.register(vm_discard_snapshot).unwrap();

    api.register(vm_replace_image).unwrap();
    api.register(vm_patch_image).unwrap();
    api.register(vm_debug_image).unwrap();
    api.register(vm_end_debug).unwrap();
    api.register(vm_discard_old_image).unwrap();
    api.register(vm_restore_image).unwrap();
    api.register(vm_replace_user_data).unwrap();
    api.register(vm_discard_old_user_data).unwrap();
    api.register(vm_restore_user_data).unwrap();
    api.register(vm_get_user_data).unwrap();

    api.register(vm_get_access_token).unwrap();
    api.register(vm_discard_access_token).unwrap();
    api.register(host_hold_lock).unwrap();
    api.register(vm_hold_lock).unwrap();

    api.register(host_change_address_pool).unwrap();
    api.register(host_register_external_leases).unwrap();
    api.register(host_list_subnets).unwrap();
    api.register(host_update_subnets).unwrap();
    api.register(host_netboot_machine).unwrap();
    api.register(netboot_file).unwrap();
    api.register(host_watch_dhcp).unwrap();
    api.register(host_observe_dhcp_packet).unwrap();
    api.register(vm_record_metadata_access).unwrap();

    api.register(vm_get_info).unwrap();
    api.register(vms_get_infos).unwrap();
    api.register(vms_list).unwrap();
    api.register(host_capacity).unwrap();
    api.register(host_updates).unwrap();
    api.register(vm_scan_root).unwrap();
    api.register(vm_probe_port).unwrap();
    api.register(vm_trace_metadata).unwrap();

    api.register(vm_console).unwrap();
    api.register(vm_manager).unwrap();
    api.register(vm_serial_port).unwrap();

    api
}

/// Starts serving `agent` on `bind_address`. The address the listener
/// actually bound becomes the name this host gives migration peers.
pub fn start(
    agent: Arc<Agent>,
    bind_address: SocketAddr,
    log: &Logger,
) -> anyhow::Result<HttpServer<AgentContext>> {
    let config = ConfigDropshot {
        bind_address,
        default_request_body_max_bytes: 1024 * 1024,
        default_handler_task_mode: HandlerTaskMode::Detached,
        log_headers: vec![],
        ..Default::default()
    };
    let server = HttpServerStarter::new(&config, api(), agent.clone(), log)
        .map_err(|error| anyhow!("Failed to start server: {}", error))?
        .start();
    let local = server.local_addr();
    if local.ip().is_unspecified() {
        warn!(log, "listening on an unspecified address; \
                    destinations cannot dial this host back for migration";
              "local_addr" => %local);
    }
    agent.set_advertised_name(local.to_string());
    info!(log, "agent listening"; "local_addr" => %local);
    Ok(server)
}
