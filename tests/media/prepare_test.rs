//! Media preparation: content types, transcoding, size policy, encoding.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use courier::media::transcode::Transcoder;
use courier::media::{
    decode_data_url, MediaError, MediaKind, MediaPreparer, PayloadEncoding,
    DEFAULT_SIZE_WARNING_BYTES,
};

use crate::transcoder::{Mode, StubTranscoder, CONVERTED_BYTES};

fn preparer(transcoder: &Arc<StubTranscoder>, threshold: u64) -> MediaPreparer {
    let transcoder: Arc<dyn Transcoder> = Arc::clone(transcoder) as Arc<dyn Transcoder>;
    MediaPreparer::new(transcoder, threshold)
}

fn write(path: &Path, bytes: &[u8]) {
    std::fs::write(path, bytes).expect("write fixture");
}

#[test]
fn mp4_encodes_as_data_url_without_transcoding() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("clip.mp4");
    let bytes: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    write(&path, &bytes);
    let transcoder = StubTranscoder::new(Mode::Convert);

    let payload = preparer(&transcoder, DEFAULT_SIZE_WARNING_BYTES)
        .prepare(&path, MediaKind::Video, PayloadEncoding::DataUrl, true)
        .expect("prepare");

    assert!(transcoder.calls().is_empty());
    assert_eq!(payload.content_type, "video/mp4");
    assert_eq!(payload.file_name(), "clip.mp4");
    assert_eq!(payload.size_bytes, 1000);
    assert!(!payload.size_warning);
    assert!(!payload.transcoded);

    let (content_type, decoded) = decode_data_url(&payload.encoded).expect("data url");
    assert_eq!(content_type, "video/mp4");
    assert_eq!(decoded, bytes);
}

#[test]
fn mov_is_transcoded_first_and_output_removed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("party.mov");
    write(&path, b"quicktime bytes");
    let transcoder = StubTranscoder::new(Mode::Convert);

    let payload = preparer(&transcoder, DEFAULT_SIZE_WARNING_BYTES)
        .prepare(&path, MediaKind::Video, PayloadEncoding::DataUrl, true)
        .expect("prepare");

    let calls = transcoder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, path);
    assert_ne!(calls[0].1.parent(), Some(dir.path()));

    assert!(payload.transcoded);
    assert_eq!(payload.content_type, "video/mp4");
    assert_eq!(payload.file_name(), "party.mov");
    let (_, decoded) = decode_data_url(&payload.encoded).expect("data url");
    assert_eq!(decoded, CONVERTED_BYTES);

    assert!(!calls[0].1.exists(), "converted file must be cleaned up");
    assert!(path.exists(), "source file is never removed");
}

#[test]
fn every_transcode_extension_invokes_transcoder() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transcoder = StubTranscoder::new(Mode::Convert);
    let preparer = preparer(&transcoder, DEFAULT_SIZE_WARNING_BYTES);

    for name in ["a.mov", "b.AVI", "c.mkv"] {
        let path = dir.path().join(name);
        write(&path, b"x");
        preparer
            .prepare(&path, MediaKind::Video, PayloadEncoding::DataUrl, true)
            .expect("prepare");
    }
    assert_eq!(transcoder.calls().len(), 3);
}

#[test]
fn failed_transcode_falls_back_to_original() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.mkv");
    write(&path, b"matroska bytes");
    let transcoder = StubTranscoder::new(Mode::Fail);

    let payload = preparer(&transcoder, DEFAULT_SIZE_WARNING_BYTES)
        .prepare(&path, MediaKind::Video, PayloadEncoding::DataUrl, true)
        .expect("prepare tolerates transcode failure");

    assert_eq!(transcoder.calls().len(), 1);
    assert!(!payload.transcoded);
    assert_eq!(payload.working_path, path);
    assert_eq!(payload.content_type, "video/x-matroska");
    let (_, decoded) = decode_data_url(&payload.encoded).expect("data url");
    assert_eq!(decoded, b"matroska bytes");
    assert!(
        !transcoder.calls()[0].1.exists(),
        "partial output must be cleaned up"
    );
}

#[test]
fn existing_converted_file_next_to_source_survives() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("party.mov");
    write(&path, b"quicktime bytes");
    let neighbour = dir.path().join("party_converted.mp4");
    write(&neighbour, b"user's own export");
    let transcoder = StubTranscoder::new(Mode::Convert);

    let payload = preparer(&transcoder, DEFAULT_SIZE_WARNING_BYTES)
        .prepare(&path, MediaKind::Video, PayloadEncoding::DataUrl, true)
        .expect("prepare");

    assert!(payload.transcoded);
    assert_eq!(
        std::fs::read(&neighbour).expect("neighbour still readable"),
        b"user's own export"
    );
}

#[test]
fn concurrent_transcodes_of_one_source_use_separate_outputs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("party.mov");
    write(&path, b"quicktime bytes");
    let transcoder = StubTranscoder::new(Mode::Convert);
    let preparer = preparer(&transcoder, DEFAULT_SIZE_WARNING_BYTES);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let payload = preparer
                    .prepare(&path, MediaKind::Video, PayloadEncoding::DataUrl, true)
                    .expect("every concurrent prepare succeeds");
                let (_, decoded) = decode_data_url(&payload.encoded).expect("data url");
                assert_eq!(decoded, CONVERTED_BYTES);
            });
        }
    });

    let mut outputs: Vec<_> = transcoder.calls().into_iter().map(|(_, out)| out).collect();
    assert_eq!(outputs.len(), 4);
    outputs.sort();
    outputs.dedup();
    assert_eq!(outputs.len(), 4, "outputs must not be shared");
    assert!(outputs.iter().all(|out| !out.exists()));
}

#[test]
fn vanished_transcode_output_is_an_encoding_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("clip.mov");
    write(&path, b"mov");
    let transcoder = StubTranscoder::new(Mode::Vanish);

    let err = preparer(&transcoder, DEFAULT_SIZE_WARNING_BYTES)
        .prepare(&path, MediaKind::Video, PayloadEncoding::DataUrl, true)
        .expect_err("missing output");
    assert!(matches!(err, MediaError::Encoding { .. }), "{err:?}");
}

#[test]
fn unavailable_transcoder_leaves_existing_files_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("clip.avi");
    write(&path, b"avi bytes");
    let unrelated = dir.path().join("clip_converted.mp4");
    write(&unrelated, b"made earlier");
    let transcoder = StubTranscoder::new(Mode::Unavailable);

    let payload = preparer(&transcoder, DEFAULT_SIZE_WARNING_BYTES)
        .prepare(&path, MediaKind::Video, PayloadEncoding::DataUrl, true)
        .expect("prepare");

    assert!(!payload.transcoded);
    assert!(unrelated.exists());
}

#[test]
fn transcoding_can_be_disabled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("clip.mov");
    write(&path, b"mov");
    let transcoder = StubTranscoder::new(Mode::Convert);

    let payload = preparer(&transcoder, DEFAULT_SIZE_WARNING_BYTES)
        .prepare(&path, MediaKind::Video, PayloadEncoding::DataUrl, false)
        .expect("prepare");
    assert!(transcoder.calls().is_empty());
    assert_eq!(payload.content_type, "video/quicktime");
}

#[test]
fn file_at_threshold_carries_size_warning() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("big.mp4");
    File::create(&path)
        .and_then(|file| file.set_len(DEFAULT_SIZE_WARNING_BYTES))
        .expect("sparse fixture");
    let transcoder = StubTranscoder::new(Mode::Convert);

    let payload = preparer(&transcoder, DEFAULT_SIZE_WARNING_BYTES)
        .prepare(&path, MediaKind::Video, PayloadEncoding::Base64, true)
        .expect("large files still prepare");
    assert!(payload.size_warning);
    assert_eq!(payload.size_bytes, DEFAULT_SIZE_WARNING_BYTES);
}

#[test]
fn file_below_threshold_has_no_warning() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("small.jpg");
    write(&path, b"123");
    let transcoder = StubTranscoder::new(Mode::Convert);

    let payload = preparer(&transcoder, 4)
        .prepare(&path, MediaKind::Image, PayloadEncoding::Base64, false)
        .expect("prepare");
    assert!(!payload.size_warning);
    assert_eq!(payload.encoded, "MTIz");
}

#[test]
fn skipped_encoding_leaves_payload_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("photo.png");
    write(&path, b"png bytes");
    let transcoder = StubTranscoder::new(Mode::Convert);

    let payload = preparer(&transcoder, 4)
        .prepare(&path, MediaKind::Image, PayloadEncoding::Skip, false)
        .expect("prepare");
    assert!(payload.encoded.is_empty());
    assert_eq!(payload.content_type, "image/png");
    assert_eq!(payload.working_path, path);
    assert_eq!(payload.size_bytes, 9);
    assert!(payload.size_warning);
}

#[test]
fn unknown_or_mismatched_extension_uses_generic_type() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transcoder = StubTranscoder::new(Mode::Convert);
    let preparer = preparer(&transcoder, DEFAULT_SIZE_WARNING_BYTES);

    let unknown = dir.path().join("photo.heic");
    write(&unknown, b"x");
    let payload = preparer
        .prepare(&unknown, MediaKind::Image, PayloadEncoding::DataUrl, false)
        .expect("prepare");
    assert_eq!(payload.content_type, "image/jpeg");
    assert!(payload.encoded.starts_with("data:image/jpeg;base64,"));

    let mismatched = dir.path().join("still.png");
    write(&mismatched, b"x");
    let payload = preparer
        .prepare(&mismatched, MediaKind::Video, PayloadEncoding::DataUrl, false)
        .expect("prepare");
    assert_eq!(payload.content_type, "video/mp4");
}

#[test]
fn missing_file_is_reported() {
    let transcoder = StubTranscoder::new(Mode::Convert);
    let err = preparer(&transcoder, DEFAULT_SIZE_WARNING_BYTES)
        .prepare(
            Path::new("./videos/missing.mp4"),
            MediaKind::Video,
            PayloadEncoding::DataUrl,
            true,
        )
        .expect_err("missing file");
    assert!(matches!(err, MediaError::FileNotFound(_)));
    assert_eq!(err.to_string(), "File not found: ./videos/missing.mp4");
    assert!(transcoder.calls().is_empty());
}
