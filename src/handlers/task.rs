use axum::{
    extract::{multipart::Field, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use crate::errors::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::models::{ProcessForm, ResultMap, TaskId};
use crate::services::{FileStore, Upload};
use crate::state::AppState;

// Form contents collected while walking the multipart body
#[derive(Default)]
struct UploadData {
    upload: Option<Upload>,
    form: ProcessForm,
}

pub async fn process_upload(
    State(state): State<AppState>,
    Extension(CurrentUser(owner)): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> AppResult<Response> {
    let mut data = UploadData::default();
    if let Err(e) = process_multipart_form(&mut multipart, &state.files, &owner, &mut data).await {
        if let Some(upload) = data.upload {
            state.files.discard(&upload.path).await;
        }
        return Err(e);
    }

    let upload = data.upload.ok_or_else(|| {
        tracing::warn!("No FASTA file was uploaded by {}", owner);
        AppError::Upload("No FASTA file uploaded".into())
    })?;

    let task_id = state.tasks.submit(&owner, upload, data.form.into()).await?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))).into_response())
}

// Walks the multipart fields, storing the FASTA file and parsing parameters.
// Whatever was stored is left in `data` so the caller can clean up on error.
async fn process_multipart_form(
    multipart: &mut Multipart,
    files: &FileStore,
    owner: &str,
    data: &mut UploadData,
) -> AppResult<()> {
    tracing::debug!("Processing multipart form for user: {}", owner);

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::warn!("Failed to get next field from multipart form: {}", e);
        AppError::Upload(format!("Failed to process form field: {}", e))
    })? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "fasta_file" => {
                let upload = handle_file_upload(field, files, owner).await?;
                tracing::debug!("Stored upload {} at {}", upload.filename, upload.path.display());
                if let Some(previous) = data.upload.replace(upload) {
                    files.discard(&previous.path).await;
                }
            }
            "n_trial" => data.form.n_trial = parse_field_value(field).await?,
            "top_k" => data.form.top_k = parse_field_value(field).await?,
            "revcom_mode" => data.form.revcom_mode = parse_bool_field(field).await?,
            "min_ham_dist_mode" => data.form.min_ham_dist_mode = parse_bool_field(field).await?,
            other => tracing::warn!("Unexpected form field: {}", other),
        }
    }

    Ok(())
}

async fn handle_file_upload(mut field: Field<'_>, files: &FileStore, owner: &str) -> AppResult<Upload> {
    let filename = field
        .file_name()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::Upload("Missing filename in upload".into()))?
        .to_string();

    let (path, mut writer) = files.create_upload(owner, &filename).await?;

    let written = async {
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| AppError::Upload(format!("Failed to read uploaded file: {}", e)))?
        {
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        Ok::<_, AppError>(())
    }
    .await;

    if let Err(e) = written {
        tracing::warn!("Upload of {} for {} failed: {}", filename, owner, e);
        files.discard(&path).await;
        return Err(e);
    }

    Ok(Upload { filename, path })
}

async fn parse_field_value<T>(field: Field<'_>) -> AppResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value = field
        .text()
        .await
        .map_err(|e| AppError::Upload(format!("Failed to read field: {}", e)))?;

    value.trim().parse().map_err(|e| {
        AppError::Upload(format!("Failed to parse field value '{}': {}", value, e))
    })
}

async fn parse_bool_field(field: Field<'_>) -> AppResult<bool> {
    let value = field
        .text()
        .await
        .map_err(|e| AppError::Upload(format!("Failed to read boolean field: {}", e)))?;

    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(AppError::Upload(format!(
            "Invalid boolean value '{}', expected 'true' or 'false'",
            value
        ))),
    }
}

pub async fn get_task_status(
    State(state): State<AppState>,
    Extension(CurrentUser(owner)): Extension<CurrentUser>,
    Path(task_id): Path<String>,
) -> AppResult<Response> {
    let payload = state.tasks.get_status(&TaskId::from(task_id), &owner).await?;
    Ok(Json(payload).into_response())
}

pub async fn download_results(
    State(state): State<AppState>,
    Extension(CurrentUser(owner)): Extension<CurrentUser>,
    Path(task_id): Path<String>,
) -> AppResult<Response> {
    let id = TaskId::from(task_id);
    let result = state.tasks.download_result(&id, &owner).await?;
    let filename = format!("results_{}.txt", id);

    tracing::info!("Sending {} motifs of task {} to {}", result.len(), id, owner);
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        render_result(&result),
    )
        .into_response())
}

/// One `motif: score` line per entry, highest score first.
pub(crate) fn render_result(result: &ResultMap) -> String {
    let mut entries: Vec<(&String, &u32)> = result.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

    entries
        .into_iter()
        .map(|(motif, score)| format!("{}: {}\n", motif, score))
        .collect()
}
