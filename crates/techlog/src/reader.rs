//! 증분 이벤트 리더 -- 증가하는 기술 로그 파일을 이벤트 단위로 분할합니다.
//!
//! [`EventReader`]는 파일 경로와 시작 바이트 오프셋(0 또는 이전에 반환된
//! [`position`](EventReader::position))으로 생성되며, [`move_next`](EventReader::move_next)
//! 호출마다 이벤트 하나를 만들어 냅니다.
//!
//! # 이벤트 경계
//! 줄이 `DD:DD.`(숫자 2개, 콜론, 숫자 2개, 점)로 시작하면 새 이벤트의 시작입니다.
//! 그 외의 줄(스택 트레이스 등)은 현재 이벤트에 이어 붙습니다. 판정은 텍스트 디코딩 없이
//! 원시 바이트에서 수행합니다.
//!
//! # 재개
//! `position()`은 마지막으로 완성된 이벤트 직후의 바이트 오프셋입니다.
//! 같은 파일을 이 오프셋으로 다시 열면 남은 이벤트 시퀀스가 동일하게 재생됩니다.
//!
//! # 파일 끝
//! - 줄바꿈으로 끝나는 완성된 줄까지 모인 이벤트는 파일 끝에서 내보냅니다.
//! - 줄바꿈 없이 끝나는 마지막 줄은 내보내지 않습니다. `move_next`는 `false`를 반환하고
//!   `position()`은 이벤트 시작에 머무르며, 이후 호출이 이어서 읽습니다.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::error::TechLogError;

/// 파일 읽기 단위 (바이트)
pub const READ_BUFFER_SIZE: usize = 4096;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// 이벤트 시작 표식 길이 (`MM:SS.`)
const MARKER_LEN: usize = 6;

/// 줄 머리가 이벤트 시작 표식(`DD:DD.`)인지 확인합니다.
///
/// `line`에 최소 6바이트가 있어야 `true`가 될 수 있습니다.
pub fn is_event_start(line: &[u8]) -> bool {
    line.len() >= MARKER_LEN
        && line[0].is_ascii_digit()
        && line[1].is_ascii_digit()
        && line[2] == b':'
        && line[3].is_ascii_digit()
        && line[4].is_ascii_digit()
        && line[5] == b'.'
}

/// 파일 이름(`YYMMDDHH`)으로부터 타임스탬프 접두어 `20YY-MM-DD HH:`를 만듭니다.
pub fn timestamp_prefix(file: &str) -> Result<String, TechLogError> {
    let digits = file.as_bytes();
    if digits.len() != 8 || !digits.iter().all(u8::is_ascii_digit) {
        return Err(TechLogError::InvalidFileName {
            file: file.to_owned(),
        });
    }
    Ok(format!(
        "20{}-{}-{} {}:",
        &file[0..2],
        &file[2..4],
        &file[4..6],
        &file[6..8]
    ))
}

/// 재개 가능한 증분 이벤트 리더
pub struct EventReader {
    path: PathBuf,
    folder: String,
    file_name: String,
    prefix: String,
    handle: File,
    read_buf: Box<[u8]>,
    /// `position`부터 시작하는, 아직 이벤트로 내보내지 않은 바이트
    pending: Vec<u8>,
    /// `pending` 안에서 다음 줄바꿈을 찾기 시작할 위치
    scan_from: usize,
    position: u64,
    event_start: u64,
    bom_checked: bool,
    event_content: String,
}

impl EventReader {
    /// 파일을 열고 `position` 오프셋으로 이동합니다.
    ///
    /// `folder`는 상위 디렉토리 이름, `file`은 확장자를 뺀 파일 이름입니다.
    pub async fn open(path: impl AsRef<Path>, position: u64) -> Result<Self, TechLogError> {
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_owned();
        let folder = path
            .parent()
            .and_then(Path::file_name)
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_owned();
        let prefix = timestamp_prefix(&file_name)?;

        let mut handle = File::open(&path).await?;
        if position > 0 {
            handle.seek(SeekFrom::Start(position)).await?;
        }

        tracing::debug!(file = %path.display(), offset = position, "opened tech log reader");

        Ok(Self {
            path,
            folder,
            file_name,
            prefix,
            handle,
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            pending: Vec::with_capacity(READ_BUFFER_SIZE),
            scan_from: 0,
            position,
            event_start: position,
            bom_checked: position > 0,
            event_content: String::new(),
        })
    }

    /// 다음 이벤트를 읽습니다.
    ///
    /// 이벤트가 만들어지면 `true`, 현재 파일 끝에 도달하면 `false`를 반환합니다.
    /// `false` 이후에도 파일이 자라면 다시 호출할 수 있습니다.
    pub async fn move_next(&mut self) -> Result<bool, TechLogError> {
        loop {
            if let Some(end) = self.find_event_end() {
                self.emit(end);
                return Ok(true);
            }

            if self.fill().await? == 0 {
                if self.event_started() && self.pending.last() == Some(&b'\n') {
                    self.emit(self.pending.len());
                    return Ok(true);
                }
                return Ok(false);
            }
        }
    }

    /// 마지막으로 완성된 이벤트 직후의 바이트 오프셋
    pub fn position(&self) -> u64 {
        self.position
    }

    /// 마지막 이벤트의 시작 바이트 오프셋
    pub fn event_start(&self) -> u64 {
        self.event_start
    }

    /// 마지막 이벤트의 원문 (타임스탬프 접두어 포함, 끝 공백 제거)
    pub fn event_content(&self) -> &str {
        &self.event_content
    }

    /// 프로세스 폴더 이름 (예: `rphost_1234`)
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// 확장자를 뺀 파일 이름 (예: `23011512`)
    pub fn file(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn fill(&mut self) -> Result<usize, TechLogError> {
        let read = self.handle.read(&mut self.read_buf).await?;
        self.pending.extend_from_slice(&self.read_buf[..read]);
        Ok(read)
    }

    fn event_started(&self) -> bool {
        is_event_start(&self.pending)
    }

    /// BOM과 첫 이벤트 이전의 줄을 건너뛴 뒤, 현재 이벤트의 끝(다음 이벤트 시작 줄의
    /// 위치)을 찾습니다.
    fn find_event_end(&mut self) -> Option<usize> {
        if !self.skip_preamble() {
            return None;
        }

        loop {
            let lf = self.pending[self.scan_from..]
                .iter()
                .position(|b| *b == b'\n')?
                + self.scan_from;
            let line_start = lf + 1;
            let line = &self.pending[line_start..];

            if line.len() >= MARKER_LEN {
                if is_event_start(line) {
                    return Some(line_start);
                }
            } else if !line.contains(&b'\n') {
                // 다음 줄 머리가 아직 6바이트 미만이므로 더 읽어야 판정 가능
                self.scan_from = lf;
                return None;
            }
            self.scan_from = line_start;
        }
    }

    /// 이벤트 시작 표식이 `pending` 머리에 올 때까지 앞부분을 버립니다.
    ///
    /// 버린 바이트만큼 `position`이 전진합니다.
    fn skip_preamble(&mut self) -> bool {
        if !self.bom_checked {
            if self.pending.len() < UTF8_BOM.len() {
                return false;
            }
            if self.pending.starts_with(UTF8_BOM) {
                self.consume(UTF8_BOM.len());
            }
            self.bom_checked = true;
        }

        while !self.event_started() {
            let Some(lf) = self.pending.iter().position(|b| *b == b'\n') else {
                return false;
            };
            tracing::trace!(
                file = %self.path.display(),
                offset = self.position,
                "skipping line before first event"
            );
            self.consume(lf + 1);
        }
        true
    }

    fn consume(&mut self, count: usize) {
        self.pending.drain(..count);
        self.position += count as u64;
        self.scan_from = 0;
    }

    fn emit(&mut self, end: usize) {
        let body = String::from_utf8_lossy(&self.pending[..end]);
        let mut content = String::with_capacity(self.prefix.len() + end);
        content.push_str(&self.prefix);
        content.push_str(body.trim_end());
        self.event_content = content;
        self.event_start = self.position;
        self.consume(end);
    }
}
