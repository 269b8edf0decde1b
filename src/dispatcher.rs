//! §4.G — the command dispatcher: transmit/put/transmit-and-display/
//! delete/query actions, the chunked-upload state machine, and assembling
//! the per-command result the host acts on.

use std::time::Instant;

use crate::backend::{CellEraser, DecodeBackend};
use crate::loader::{load_image, load_placement};
use crate::parser::ParsedCommand;
use crate::response::{build_response, error_message, failure_code_and_message, success_message, ResponseFields};
use crate::store::{Compression, Format, Image, ImageStatus, Placement, ScaleMode, Store, UploadingFailure};

/// `create_placeholder` payload of the command result (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatePlaceholder {
    pub image_id: u32,
    pub placement_id: u32,
    pub columns: u32,
    pub rows: u32,
    pub do_not_move_cursor: bool,
}

/// `GraphicsCommandResult` (§6).
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommandResult {
    pub redraw: bool,
    pub response: Option<String>,
    pub error: bool,
    pub create_placeholder: Option<CreatePlaceholder>,
}

pub(crate) fn effective_quiet(cmd: &ParsedCommand) -> u8 {
    if cmd.image_id.is_none() && cmd.image_number.is_none() {
        return 2;
    }
    cmd.quiet.unwrap_or(0).clamp(0, 2) as u8
}

fn response_fields(cmd: &ParsedCommand, image_id: u32, placement_id: u32) -> ResponseFields {
    ResponseFields {
        image_id,
        image_number: cmd.image_number.unwrap_or(0).max(0) as u32,
        placement_id,
    }
}

fn apply_transmission_fields(image: &mut Image, cmd: &ParsedCommand) {
    if let Some(f) = cmd.format {
        if let Some(fmt) = Format::from_wire(f) {
            image.format = fmt;
        }
    }
    if cmd.compression == Some('z') {
        image.compression = Compression::Zlib;
    }
    if let Some(q) = cmd.quiet {
        image.quiet = q.clamp(0, 2) as u8;
    }
    if let Some(n) = cmd.image_number {
        image.image_number = Some(n.max(0) as u32);
    }
    if let Some(s) = cmd.expected_size {
        image.expected_size = Some(s.max(0) as u64);
    }
    if let Some(w) = cmd.pix_width {
        image.pix_width = w.max(0) as u32;
    }
    if let Some(h) = cmd.pix_height {
        image.pix_height = h.max(0) as u32;
    }
}

fn mark_upload_error(store: &mut Store, image_id: u32, failure: UploadingFailure) {
    if let Some(image) = store.image_mut(image_id) {
        image.status = ImageStatus::UploadingError;
        image.uploading_failure = failure;
    }
}

/// Resolves which image a direct-transmission (medium `d`) chunk targets,
/// and whether this call created a fresh `Image` record (§4.G.1, §9
/// "current image id is a single-slot session").
fn resolve_direct_image(store: &mut Store, cmd: &ParsedCommand, now: Instant) -> (u32, bool) {
    let requested = cmd.image_id.map(|v| v.max(0) as u32).filter(|&id| id != 0);

    if requested.is_none() {
        if let Some(id) = store.current_direct_upload {
            return (id, false);
        }
        let id = store.generate_image_id().unwrap_or(0);
        store.create_image(id, now);
        return (id, true);
    }

    let id = requested.unwrap();
    if let Some(image) = store.image(id) {
        if image.status == ImageStatus::Uploading {
            return (id, false);
        }
    }
    store.create_image(id, now);
    (id, true)
}

enum ChunkOutcome {
    Continuing,
    Success,
    Failure(UploadingFailure),
}

/// `append_data` (§4.G.2).
fn append_data(store: &mut Store, image_id: u32, raw_payload: &[u8], more: bool, now: Instant) -> ChunkOutcome {
    if more {
        store.current_direct_upload = Some(image_id);
    } else if store.current_direct_upload == Some(image_id) {
        store.current_direct_upload = None;
    }
    store.last_chunk_time = Some(now);

    let Some(image) = store.image(image_id) else {
        return ChunkOutcome::Failure(UploadingFailure::CannotOpenCachedFile);
    };
    if image.status != ImageStatus::Uploading {
        return if more {
            ChunkOutcome::Continuing
        } else {
            ChunkOutcome::Failure(UploadingFailure::CannotOpenCachedFile)
        };
    }

    let decoded = crate::base64::decode(raw_payload);
    let new_total = image.disk_size + decoded.len() as u64;
    let disk_cap = store.config.with_tolerance(store.config.max_image_disk_size);
    if new_total > disk_cap {
        mark_upload_error(store, image_id, UploadingFailure::OverSizeLimit);
        return ChunkOutcome::Failure(UploadingFailure::OverSizeLimit);
    }

    let path = store.cached_path(image_id);
    let write_result = (|| -> std::io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&decoded)
    })();

    if write_result.is_err() {
        mark_upload_error(store, image_id, UploadingFailure::CannotOpenCachedFile);
        return ChunkOutcome::Failure(UploadingFailure::CannotOpenCachedFile);
    }

    let chunk_len = decoded.len() as u64;
    if let Some(image) = store.image_mut(image_id) {
        image.disk_size += chunk_len;
        image.disk_path = Some(path);
    }
    store.images_disk_total += chunk_len;
    store.touch_image(image_id, now);

    if more {
        return ChunkOutcome::Continuing;
    }

    let (disk_size, expected) = store
        .image(image_id)
        .map(|i| (i.disk_size, i.expected_size))
        .unwrap_or((0, None));
    if let Some(expected) = expected {
        if expected != disk_size {
            mark_upload_error(store, image_id, UploadingFailure::UnexpectedSize);
            return ChunkOutcome::Failure(UploadingFailure::UnexpectedSize);
        }
    }
    if let Some(image) = store.image_mut(image_id) {
        image.status = ImageStatus::UploadingSuccess;
    }
    ChunkOutcome::Success
}

fn is_in_tmp_dir(path: &std::path::Path) -> bool {
    let tmp = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
    path.starts_with(&tmp) || path.starts_with("/tmp")
}

/// Medium `f`/`t`: the payload is a base64-encoded filesystem path (§4.G.1).
fn handle_file_medium(
    store: &mut Store,
    backend: &dyn DecodeBackend,
    cmd: &ParsedCommand,
    medium: char,
    quiet: u8,
    now: Instant,
) -> (CommandResult, Option<u32>) {
    let mut result = CommandResult::default();

    let requested = cmd.image_id.map(|v| v.max(0) as u32).filter(|&id| id != 0);
    let image_id = match requested {
        Some(id) => {
            store.create_image(id, now);
            id
        }
        None => match store.generate_image_id() {
            Ok(id) => {
                store.create_image(id, now);
                id
            }
            Err(_) => {
                result.error = true;
                return (result, None);
            }
        },
    };
    if let Some(image) = store.image_mut(image_id) {
        apply_transmission_fields(image, cmd);
        image.status = ImageStatus::Uploading;
    }

    let fields = response_fields(cmd, image_id, 0);

    let path_bytes = crate::base64::decode(&cmd.payload);
    let Ok(src_path_str) = String::from_utf8(path_bytes) else {
        mark_upload_error(store, image_id, UploadingFailure::CannotCopyFile);
        result.error = true;
        result.response = build_response(fields, quiet, true, &error_message("EBADF", "could not copy the image"));
        return (result, Some(image_id));
    };
    let src_path = std::path::PathBuf::from(src_path_str);

    let meta = match std::fs::metadata(&src_path) {
        Ok(m) if m.is_file() && m.len() > 0 => m,
        _ => {
            mark_upload_error(store, image_id, UploadingFailure::CannotCopyFile);
            result.error = true;
            result.response = build_response(fields, quiet, true, &error_message("EBADF", "could not copy the image"));
            return (result, Some(image_id));
        }
    };

    let disk_cap = store.config.with_tolerance(store.config.max_image_disk_size);
    if meta.len() > disk_cap {
        mark_upload_error(store, image_id, UploadingFailure::OverSizeLimit);
        result.error = true;
        let (code, detail) =
            failure_code_and_message(UploadingFailure::OverSizeLimit, store.config.max_image_disk_size, 0, 0);
        result.response = build_response(fields, quiet, true, &error_message(code, &detail));
        return (result, Some(image_id));
    }

    let dest = store.cached_path(image_id);
    if std::fs::copy(&src_path, &dest).is_err() {
        mark_upload_error(store, image_id, UploadingFailure::CannotCopyFile);
        result.error = true;
        result.response = build_response(fields, quiet, true, &error_message("EBADF", "could not copy the image"));
        return (result, Some(image_id));
    }

    let copied_len = meta.len();
    if let Some(image) = store.image_mut(image_id) {
        image.disk_size = copied_len;
        image.disk_path = Some(dest);
    }
    store.images_disk_total += copied_len;

    if let Some(expected) = cmd.expected_size {
        let expected = expected.max(0) as u64;
        if expected != copied_len {
            mark_upload_error(store, image_id, UploadingFailure::UnexpectedSize);
            result.error = true;
            let (code, detail) =
                failure_code_and_message(UploadingFailure::UnexpectedSize, 0, copied_len, expected);
            result.response = build_response(fields, quiet, true, &error_message(code, &detail));
            return (result, Some(image_id));
        }
    }

    if medium == 't' && is_in_tmp_dir(&src_path) {
        let _ = std::fs::remove_file(&src_path);
    }

    if let Some(image) = store.image_mut(image_id) {
        image.status = ImageStatus::UploadingSuccess;
    }
    store.check_limits();

    let ram_ok = load_image(store, backend, image_id);
    if ram_ok {
        result.response = build_response(fields, quiet, false, success_message());
    } else {
        result.error = true;
        result.response = build_response(fields, quiet, true, &error_message("EBADF", "could not decode image"));
    }
    (result, Some(image_id))
}

/// `t` (and the transmit half of `T`). Returns the result, the image id
/// this invocation touched (if any), and whether a fresh `Image` record
/// was created (vs. a continuation chunk) — §4.G's "T" side effect hinges
/// on that flag.
fn handle_transmit(
    store: &mut Store,
    backend: &dyn DecodeBackend,
    cmd: &ParsedCommand,
    now: Instant,
) -> (CommandResult, Option<u32>, bool) {
    let medium = cmd.medium.unwrap_or('d');
    let quiet = effective_quiet(cmd);
    let mut result = CommandResult::default();

    match medium {
        'd' => {
            let (image_id, is_new) = resolve_direct_image(store, cmd, now);
            if is_new {
                if let Some(image) = store.image_mut(image_id) {
                    apply_transmission_fields(image, cmd);
                    image.status = ImageStatus::Uploading;
                }
            }
            let more = cmd.more.unwrap_or(0) != 0;
            let outcome = append_data(store, image_id, &cmd.payload, more, now);
            store.check_limits();

            let fields = response_fields(cmd, image_id, 0);
            match outcome {
                ChunkOutcome::Continuing => {}
                ChunkOutcome::Success => {
                    let ram_ok = load_image(store, backend, image_id);
                    if ram_ok {
                        result.response = build_response(fields, quiet, false, success_message());
                    } else {
                        result.error = true;
                        result.response =
                            build_response(fields, quiet, true, &error_message("EBADF", "could not decode image"));
                    }
                }
                ChunkOutcome::Failure(failure) => {
                    result.error = true;
                    let (code, detail) =
                        failure_code_and_message(failure, store.config.max_image_disk_size, 0, 0);
                    result.response = build_response(fields, quiet, true, &error_message(code, &detail));
                }
            }
            (result, Some(image_id), is_new)
        }
        't' | 'f' => {
            let (result, image_id) = handle_file_medium(store, backend, cmd, medium, quiet, now);
            (result, image_id, true)
        }
        _ => {
            result.error = true;
            let fields = response_fields(cmd, cmd.image_id.unwrap_or(0).max(0) as u32, 0);
            result.response =
                build_response(fields, quiet, true, &error_message("EINVAL", "unsupported transmission medium"));
            (result, None, false)
        }
    }
}

fn resolve_put_image_id(store: &Store, cmd: &ParsedCommand) -> Option<u32> {
    if let Some(id) = cmd.image_id.map(|v| v.max(0) as u32).filter(|&id| id != 0) {
        return Some(id);
    }
    cmd.image_number
        .map(|v| v.max(0) as u32)
        .and_then(|number| store.image_by_number(number).map(|img| img.image_id))
}

/// `p` (and the put half of `T`).
fn handle_put(
    store: &mut Store,
    backend: &dyn DecodeBackend,
    cmd: &ParsedCommand,
    cw: u32,
    ch: u32,
    now: Instant,
    default_scale_mode: ScaleMode,
) -> CommandResult {
    let mut result = CommandResult::default();
    let quiet = effective_quiet(cmd);

    let Some(image_id) = resolve_put_image_id(store, cmd) else {
        result.error = true;
        let fields = response_fields(cmd, 0, 0);
        result.response = build_response(fields, quiet, true, &error_message("ENOENT", "no image id or number given"));
        return result;
    };
    if store.image(image_id).is_none() {
        result.error = true;
        let fields = response_fields(cmd, image_id, 0);
        result.response = build_response(fields, quiet, true, &error_message("ENOENT", "image not found"));
        return result;
    }

    let placement_id = match cmd.placement_id.map(|v| v.max(0) as u32).filter(|&id| id != 0) {
        Some(id) => id,
        None => match store.generate_placement_id(image_id) {
            Ok(id) => id,
            Err(_) => {
                result.error = true;
                return result;
            }
        },
    };

    if store.placement(image_id, placement_id).is_some() {
        store.delete_placement(image_id, placement_id);
    }

    let mut placement = Placement::new(placement_id, image_id, now);
    placement.src_x = cmd.src_x.unwrap_or(0).max(0) as u32;
    placement.src_y = cmd.src_y.unwrap_or(0).max(0) as u32;
    placement.src_width = cmd.src_width.unwrap_or(0).max(0) as u32;
    placement.src_height = cmd.src_height.unwrap_or(0).max(0) as u32;
    placement.cols = cmd.cols.unwrap_or(0).max(0) as u32;
    placement.rows = cmd.rows.unwrap_or(0).max(0) as u32;
    placement.is_virtual = cmd.virtual_placement.unwrap_or(0) != 0;
    placement.do_not_move_cursor = cmd.do_not_move_cursor.unwrap_or(0) != 0;
    placement.scale_mode = default_scale_mode;
    store.insert_placement(placement);

    let loaded = load_placement(store, backend, image_id, placement_id, cw, ch, now);
    let snapshot = store
        .placement(image_id, placement_id)
        .map(|p| (p.cols, p.rows, p.is_virtual, p.do_not_move_cursor));

    result.redraw = loaded;
    if let (true, Some((cols, rows, is_virtual, do_not_move_cursor))) = (loaded, snapshot) {
        if !is_virtual {
            result.create_placeholder = Some(CreatePlaceholder {
                image_id,
                placement_id,
                columns: cols,
                rows,
                do_not_move_cursor,
            });
        }
    }

    let fields = response_fields(cmd, image_id, placement_id);
    if loaded {
        result.response = build_response(fields, quiet, false, success_message());
    } else {
        result.error = true;
        result.response = build_response(fields, quiet, true, &error_message("EBADF", "could not load placement"));
    }
    result
}

/// `q`: per §9's resolved open question, queries transmit then discard.
fn handle_query(store: &mut Store, backend: &dyn DecodeBackend, cmd: &ParsedCommand, now: Instant) -> CommandResult {
    let mut query_cmd = cmd.clone();
    let query_id = store.generate_image_id().unwrap_or(0);
    query_cmd.image_id = Some(i64::from(query_id));

    let (result, image_id, _is_new) = handle_transmit(store, backend, &query_cmd, now);
    if let Some(image_id) = image_id {
        store.delete_image(image_id);
    }
    result
}

/// `d` (§4.G.3).
fn handle_delete(store: &mut Store, grid: &mut dyn CellEraser, cmd: &ParsedCommand) -> CommandResult {
    let mut result = CommandResult::default();
    let spec = cmd.delete_spec.unwrap_or('a');
    let delete_images_too = spec.is_ascii_uppercase();
    let sub = spec.to_ascii_lowercase();

    let target_image_id: Option<u32> = match sub {
        'i' => cmd.image_id.map(|v| v.max(0) as u32),
        'n' => cmd
            .image_number
            .map(|v| v.max(0) as u32)
            .and_then(|number| store.image_by_number(number).map(|img| img.image_id)),
        _ => None,
    };
    let target_placement_id = cmd.placement_id.map(|v| v.max(0) as u32).filter(|&id| id != 0);

    let mut erased: Vec<(u32, u32)> = Vec::new();
    grid.for_each_image_cell(&mut |image_id, placement_id, _col, _row, is_classic| {
        if !is_classic {
            return false;
        }
        let matches = match target_image_id {
            Some(id) => image_id == id && target_placement_id.is_none_or(|p| p == placement_id),
            None => true,
        };
        if matches {
            erased.push((image_id, placement_id));
        }
        matches
    });

    let mut touched_images = std::collections::HashSet::new();
    for (image_id, placement_id) in &erased {
        store.delete_placement(*image_id, *placement_id);
        touched_images.insert(*image_id);
    }
    if delete_images_too {
        for image_id in touched_images {
            if store.placements_of(image_id).next().is_none() {
                store.delete_image(image_id);
            }
        }
    }

    result.redraw = !erased.is_empty();
    let quiet = effective_quiet(cmd);
    let fields = response_fields(
        cmd,
        cmd.image_id.unwrap_or(0).max(0) as u32,
        cmd.placement_id.unwrap_or(0).max(0) as u32,
    );
    result.response = build_response(fields, quiet, false, success_message());
    result
}

fn handle_no_action(store: &mut Store, backend: &dyn DecodeBackend, cmd: &ParsedCommand, now: Instant) -> CommandResult {
    if cmd.more.is_some() {
        handle_transmit(store, backend, cmd, now).0
    } else {
        let mut result = CommandResult::default();
        result.error = true;
        let fields = response_fields(cmd, cmd.image_id.unwrap_or(0).max(0) as u32, 0);
        result.response = build_response(fields, effective_quiet(cmd), true, &error_message("EINVAL", "missing action"));
        result
    }
}

/// `T`: transmit, then (only if this call both created a fresh image
/// record and carried the upload all the way to `UploadingSuccess`) put
/// using the same fields. Checking `is_new && !result.error` alone is not
/// enough: the first chunk of a chunked `a=T` (`m=1`) is also new and
/// error-free, but the image is still `Uploading` — running put against
/// it would send `load_placement` after an image with no decoded RAM
/// buffer yet, which can only fail.
fn handle_transmit_and_display(
    store: &mut Store,
    backend: &dyn DecodeBackend,
    cmd: &ParsedCommand,
    cw: u32,
    ch: u32,
    now: Instant,
) -> CommandResult {
    let (mut result, image_id, is_new) = handle_transmit(store, backend, cmd, now);
    let completed = image_id
        .and_then(|id| store.image(id))
        .is_some_and(|image| image.status == ImageStatus::UploadingSuccess);
    if let (Some(image_id), true, true) = (image_id, is_new, completed) {
        let mut put_cmd = cmd.clone();
        put_cmd.image_id = Some(i64::from(image_id));
        let put_result = handle_put(store, backend, &put_cmd, cw, ch, now, ScaleMode::Fill);

        result.redraw = result.redraw || put_result.redraw;
        if put_result.create_placeholder.is_some() {
            result.create_placeholder = put_result.create_placeholder;
        }
        if put_result.response.is_some() {
            result.response = put_result.response;
        }
        result.error = result.error || put_result.error;
    }
    result
}

/// Dispatches one parsed command (§4.G). `cw`/`ch` are the host's current
/// cell metrics, needed to size/scale any placement created along the way.
pub fn dispatch(
    store: &mut Store,
    backend: &dyn DecodeBackend,
    grid: &mut dyn CellEraser,
    cmd: &ParsedCommand,
    cw: u32,
    ch: u32,
    now: Instant,
) -> CommandResult {
    match cmd.action {
        Some('t') => handle_transmit(store, backend, cmd, now).0,
        Some('T') => handle_transmit_and_display(store, backend, cmd, cw, ch, now),
        Some('p') => handle_put(store, backend, cmd, cw, ch, now, ScaleMode::Contain),
        Some('q') => handle_query(store, backend, cmd, now),
        Some('d') => handle_delete(store, grid, cmd),
        None => handle_no_action(store, backend, cmd, now),
        Some(_) => {
            let mut result = CommandResult::default();
            result.error = true;
            result.response =
                build_response(ResponseFields::default(), effective_quiet(cmd), true, &error_message("EINVAL", "unsupported action"));
            result
        }
    }
}
