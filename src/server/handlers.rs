use crate::error::{Error, Result};
use crate::metadata::UploadMetadata;
use crate::server::{AppState, SharedState};
use crate::staging::UploadInfo;
use crate::strategy::uses_original_filename;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use log::{debug, info};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

pub(crate) const TUS_VERSION: &str = "1.0.0";
pub(crate) const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
const UPLOAD_COMPLETE: HeaderName = HeaderName::from_static("upload-complete");

const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

fn tus_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    headers
}

fn required_header<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Protocol(format!("Missing {name} header")))
}

fn parse_u64(value: &str, name: &HeaderName) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::Protocol(format!("Invalid {name} header")))
}

/// POST `/api/upload/`: allocates a staging entry for a new upload.
pub async fn create(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Response> {
    let length = parse_u64(required_header(&headers, &UPLOAD_LENGTH)?, &UPLOAD_LENGTH)?;
    if length > state.config.max_file_size {
        return Err(Error::TooLarge(length, state.config.max_file_size));
    }

    let raw = headers
        .get(&UPLOAD_METADATA)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let metadata = UploadMetadata::parse_header(raw);

    // Duplicate pre-rejection: the only point where a collision is refused.
    // Every other duplicate policy renames at finalize instead.
    if metadata.with_filename.as_deref() == Some("original")
        && metadata.on_duplicate.as_deref().unwrap_or("prevent") == "prevent"
    {
        if let Some(filename) = metadata.filename.as_deref().filter(|f| !f.is_empty()) {
            let name = state.paths.sanitize(filename);
            let dest = metadata.destination_path.as_deref().unwrap_or("");
            if state.paths.exists(&name, dest) {
                return Err(Error::DuplicateFile(name));
            }
        }
    }

    let info = state.store.create(length, metadata).await?;
    debug!("created upload {} ({} bytes)", info.id, length);

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let location = format!("{scheme}://{host}/api/upload/{}", info.id);

    let mut response_headers = tus_headers();
    response_headers.insert(
        header::LOCATION,
        HeaderValue::from_str(&location)
            .map_err(|_| Error::Protocol("Invalid Host header".to_string()))?,
    );
    response_headers.insert(UPLOAD_OFFSET, HeaderValue::from(0u64));

    Ok((StatusCode::CREATED, response_headers, ()).into_response())
}

/// PATCH `/api/upload/{id}`: appends the request body at the stored offset.
pub async fn append(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Response> {
    let headers = request.headers();
    let client_offset = parse_u64(required_header(headers, &UPLOAD_OFFSET)?, &UPLOAD_OFFSET)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type != OFFSET_CONTENT_TYPE {
        return Err(Error::Protocol(format!(
            "Content-Type must be {OFFSET_CONTENT_TYPE}"
        )));
    }

    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let lock = state.locks.acquire(&id);
    let _guard = lock.lock().await;

    let Some(mut info) = state.store.read_info(&id).await? else {
        return Err(Error::NotFound(id));
    };
    if client_offset != info.offset {
        return Err(Error::OffsetMismatch {
            expected: info.offset,
            got: client_offset,
        });
    }

    let remaining = info.size - info.offset;
    if content_length.is_some_and(|len| len > remaining) {
        return Err(Error::Protocol(
            "Request body exceeds Upload-Length".to_string(),
        ));
    }

    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let reader = StreamReader::new(stream);
    let written = state.store.append(&id, info.offset, reader.take(remaining)).await?;

    info.offset += written;
    state.store.write_info(&info).await?;
    debug!("upload {id} at offset {} of {}", info.offset, info.size);

    let mut whole_file_done = false;
    if info.offset >= info.size {
        whole_file_done = finalize(&state, &info).await?;
        state.locks.release(&id);
    }

    let mut response_headers = tus_headers();
    response_headers.insert(UPLOAD_OFFSET, HeaderValue::from(info.offset));
    if whole_file_done {
        response_headers.insert(UPLOAD_COMPLETE, HeaderValue::from_static("true"));
    }

    Ok((StatusCode::NO_CONTENT, response_headers, ()).into_response())
}

/// HEAD `/api/upload/{id}`: reports the persisted offset for resumption.
pub async fn head(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let Some(info) = state.store.read_info(&id).await? else {
        return Err(Error::NotFound(id));
    };

    let mut response_headers = tus_headers();
    response_headers.insert(UPLOAD_OFFSET, HeaderValue::from(info.offset));
    response_headers.insert(UPLOAD_LENGTH, HeaderValue::from(info.size));
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    Ok((StatusCode::OK, response_headers, ()).into_response())
}

/// OPTIONS `/api/upload/`: advertises protocol version and extensions.
pub async fn options() -> Response {
    let mut response_headers = tus_headers();
    response_headers.insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
    response_headers.insert(
        TUS_EXTENSION,
        HeaderValue::from_static("creation,termination"),
    );

    (StatusCode::NO_CONTENT, response_headers, ()).into_response()
}

/// DELETE `/api/upload/{id}`: the termination extension. Removes the
/// staging entry and aborts a pending sibling assembly.
pub async fn terminate(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let lock = state.locks.acquire(&id);
    let _guard = lock.lock().await;

    let Some(info) = state.store.read_info(&id).await? else {
        return Err(Error::NotFound(id));
    };

    if info.metadata.is_multipart_part() {
        if let Some(multipart_id) = info.metadata.multipart_id.as_deref() {
            state.assembler.discard(multipart_id).await;
        }
    }

    state.store.remove(&id).await?;
    state.locks.release(&id);
    info!("upload {id} terminated");

    Ok((StatusCode::NO_CONTENT, tus_headers(), ()).into_response())
}

/// Runs after an upload's last accepted byte. Returns whether the whole
/// logical file (across siblings for multipart) is now done.
async fn finalize(state: &AppState, info: &UploadInfo) -> Result<bool> {
    if info.metadata.is_multipart_part() {
        state
            .assembler
            .handle_part_completion(state, &info.id, &info.metadata)
            .await
    } else {
        finalize_solo(state, info).await?;
        Ok(true)
    }
}

/// Moves a completed upload out of staging to its final destination.
pub(crate) async fn finalize_solo(state: &AppState, info: &UploadInfo) -> Result<()> {
    let final_name = state
        .strategies
        .final_filename(&state.paths, &info.metadata, &info.id)?;
    let dest = info.metadata.destination_path.as_deref().unwrap_or("");
    let target = state.paths.full_path(&final_name, dest);

    state.store.move_payload(&info.id, &target).await?;

    if uses_original_filename(&info.metadata) {
        let mut sidecar_target = target.clone().into_os_string();
        sidecar_target.push(".json");
        state
            .store
            .move_sidecar(&info.id, std::path::Path::new(&sidecar_target))
            .await?;
    } else {
        state.store.remove_sidecar(&info.id).await?;
    }

    info!("upload {} finalized at {}", info.id, target.display());
    Ok(())
}
