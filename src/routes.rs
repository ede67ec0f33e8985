use std::convert::TryInto;
use std::io;

use actix_web::dev::{Body, SizedStream};
use actix_web::error::PayloadError;
use actix_web::http::header::{
    Charset, ContentDisposition, DispositionParam, DispositionType, ExtendedValue,
};
use actix_web::web::{self, BytesMut};
use actix_web::{delete, get, post, HttpRequest, HttpResponse};
use futures::stream::{self, StreamExt, TryStreamExt};
use futures::future;
use serde::Serialize;

use crate::download::{self, SharePreview};
use crate::error::ShareError;
use crate::identity::{client_ip, Caller};
use crate::models::{ActivityLog, ShareSummary};
use crate::shares;
use crate::state::AppState;
use crate::upload::{self, UploadMetadata};

const METADATA_LEN_PREFIX: usize = 8;
const METADATA_MAX_LEN: u64 = 16 * 1024;

#[derive(Serialize)]
struct UploadResponse {
    success: bool,
    message: &'static str,
    share_id: String,
    download_url: String,
    expires_at: chrono::NaiveDateTime,
}

#[derive(Serialize)]
struct MessageResponse {
    success: bool,
    message: String,
}

#[derive(Serialize)]
struct ShareListResponse {
    success: bool,
    shares: Vec<ShareSummary>,
}

#[derive(Serialize)]
struct PreviewResponse {
    success: bool,
    file: SharePreview,
}

#[derive(Serialize)]
struct ActivityResponse {
    success: bool,
    logs: Vec<ActivityLog>,
}

fn payload_error(e: PayloadError) -> ShareError {
    ShareError::Io(io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string()))
}

fn malformed_request() -> ShareError {
    ShareError::Validation("Malformed request.".to_string())
}

async fn read_next_payload_chunk_into_buffer(
    payload: &mut web::Payload,
    buffer: &mut BytesMut,
) -> Result<(), ShareError> {
    match payload.next().await {
        Some(chunk) => {
            buffer.extend_from_slice(&chunk.map_err(payload_error)?);
            Ok(())
        }
        None => Err(malformed_request()),
    }
}

async fn get_upload_metadata_size(
    payload: &mut web::Payload,
    buffer: &mut BytesMut,
) -> Result<usize, ShareError> {
    while buffer.len() < METADATA_LEN_PREFIX {
        read_next_payload_chunk_into_buffer(payload, buffer).await?;
    }
    let prefix = buffer.split_to(METADATA_LEN_PREFIX);
    let size = u64::from_be_bytes(prefix.as_ref().try_into().map_err(|_| malformed_request())?);
    if size == 0 || size > METADATA_MAX_LEN {
        return Err(malformed_request());
    }
    Ok(size as usize)
}

async fn get_upload_metadata(
    metadata_size: usize,
    payload: &mut web::Payload,
    buffer: &mut BytesMut,
) -> Result<UploadMetadata, ShareError> {
    while buffer.len() < metadata_size {
        read_next_payload_chunk_into_buffer(payload, buffer).await?;
    }
    let metadata_bytes = buffer.split_to(metadata_size);
    serde_json::from_slice(&metadata_bytes)
        .map_err(|_| ShareError::Validation("Could not parse request.".to_string()))
}

/// Body framing: 8-byte big-endian metadata length, JSON metadata, then
/// exactly `data_len` bytes of file content.
#[post("/upload")]
async fn upload_file(
    state: web::Data<AppState>,
    caller: Caller,
    req: HttpRequest,
    mut payload: web::Payload,
) -> Result<HttpResponse, ShareError> {
    let mut buffer = BytesMut::new();
    let metadata_size = get_upload_metadata_size(&mut payload, &mut buffer).await?;
    let metadata = get_upload_metadata(metadata_size, &mut payload, &mut buffer).await?;

    let head = buffer.freeze();
    let body = stream::once(future::ready(Ok(head)))
        .chain(payload.map_err(payload_error))
        .boxed_local();

    let receipt = upload::upload(&state, &caller, metadata, body, &client_ip(&req)).await?;
    Ok(HttpResponse::Ok().json(UploadResponse {
        success: true,
        message: "File uploaded and shared successfully.",
        share_id: receipt.share_id,
        download_url: receipt.download_url,
        expires_at: receipt.expires_at,
    }))
}

fn ascii_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_graphic() || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn attachment(file_name: &str) -> ContentDisposition {
    ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters: vec![
            DispositionParam::Filename(ascii_file_name(file_name)),
            DispositionParam::FilenameExt(ExtendedValue {
                charset: Charset::Ext("UTF-8".to_string()),
                language_tag: None,
                value: file_name.as_bytes().to_vec(),
            }),
        ],
    }
}

/// Headers go out before the ciphertext has been verified. The body holds back
/// its last chunk until the tag checks out, so an integrity failure always
/// leaves the response short of its Content-Length and the connection is
/// aborted instead of completing.
#[get("/download/{token}")]
async fn download_file(
    state: web::Data<AppState>,
    caller: Option<Caller>,
    req: HttpRequest,
    token: web::Path<String>,
) -> Result<HttpResponse, ShareError> {
    let download =
        download::download(&state, &token, caller.as_ref(), &client_ip(&req)).await?;

    let body = SizedStream::new(
        download.size_bytes,
        download.body.map_err(actix_web::Error::from),
    );
    Ok(HttpResponse::Ok()
        .content_type(download.mime_type.as_str())
        .set(attachment(&download.file_name))
        .body(Body::from_message(body)))
}

#[get("/metadata/{token}")]
async fn share_metadata(
    state: web::Data<AppState>,
    caller: Option<Caller>,
    token: web::Path<String>,
) -> Result<HttpResponse, ShareError> {
    let file = download::preview(&state, &token, caller.as_ref()).await?;
    Ok(HttpResponse::Ok().json(PreviewResponse {
        success: true,
        file,
    }))
}

#[delete("/shares/{id}")]
async fn revoke_share(
    state: web::Data<AppState>,
    caller: Caller,
    req: HttpRequest,
    share_id: web::Path<String>,
) -> Result<HttpResponse, ShareError> {
    shares::revoke(&state, &share_id, &caller, &client_ip(&req)).await?;
    Ok(HttpResponse::Ok().json(MessageResponse {
        success: true,
        message: "Access revoked.".to_string(),
    }))
}

#[get("/shares/sent")]
async fn sent_shares(
    state: web::Data<AppState>,
    caller: Caller,
) -> Result<HttpResponse, ShareError> {
    let shares = shares::sent(&state, &caller).await?;
    Ok(HttpResponse::Ok().json(ShareListResponse {
        success: true,
        shares,
    }))
}

#[get("/shares/received")]
async fn received_shares(
    state: web::Data<AppState>,
    caller: Caller,
) -> Result<HttpResponse, ShareError> {
    let shares = shares::received(&state, &caller).await?;
    Ok(HttpResponse::Ok().json(ShareListResponse {
        success: true,
        shares,
    }))
}

#[delete("/admin/users/{id}")]
async fn delete_user(
    state: web::Data<AppState>,
    caller: Caller,
    req: HttpRequest,
    user_id: web::Path<String>,
) -> Result<HttpResponse, ShareError> {
    let removed = shares::delete_account(&state, &caller, &user_id, &client_ip(&req)).await?;
    Ok(HttpResponse::Ok().json(MessageResponse {
        success: true,
        message: format!("User deleted along with {} shared files.", removed),
    }))
}

#[get("/admin/activity")]
async fn activity(
    state: web::Data<AppState>,
    caller: Caller,
) -> Result<HttpResponse, ShareError> {
    let logs = shares::recent_activity(&state, &caller).await?;
    Ok(HttpResponse::Ok().json(ActivityResponse {
        success: true,
        logs,
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(upload_file)
        .service(download_file)
        .service(share_metadata)
        .service(sent_shares)
        .service(received_shares)
        .service(revoke_share)
        .service(delete_user)
        .service(activity);
}
