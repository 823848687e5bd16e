// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use logqueue::qdisk;
use std::io::Write;
use std::path::Path;

pub fn info(path: &Path, out: &mut impl Write) -> Result<()> {
    let info = qdisk::inspect(path)
        .with_context(|| format!("Error reading disk-buffer file {}", path.display()))?;
    let header = &info.header;
    writeln!(
        out,
        "Disk-buffer state loaded; filename='{}', reliable='{}', number_of_messages='{}', \
         queue_length='{}', front_cache_length='{}', flow_control_window_length='{}', \
         read_head='{}', write_head='{}', used_bytes='{}', capacity_bytes='{}', file_size='{}'",
        info.path.display(),
        header.reliable,
        info.number_of_messages,
        header.length,
        header.front_cache_count,
        header.window_count,
        header.read_head,
        header.write_head,
        header.used_bytes,
        header.capacity_bytes,
        info.file_len,
    )?;
    Ok(())
}

pub fn cat(path: &Path, out: &mut impl Write) -> Result<()> {
    let contents = qdisk::read_contents(path)
        .with_context(|| format!("Error reading disk-buffer file {}", path.display()))?;
    for message in contents.into_messages() {
        out.write_all(&message)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use logqueue::qdisk::{QueueFile, QueueFileId};
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, messages: &[&str]) -> std::path::PathBuf {
        let id = QueueFileId::new(0);
        let path = dir.path().join(id.file_name(false));
        let mut file = QueueFile::create(&path, id, 1024 * 1024, false, false).unwrap();
        for message in messages {
            assert!(file.write(message.as_bytes()).unwrap());
        }
        path
    }

    #[test]
    fn test_info_reports_number_of_messages() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, &["a", "b", "c"]);

        let mut out = Vec::new();
        info(&path, &mut out).unwrap();
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("number_of_messages='3'"));
        assert!(printed.contains("reliable='false'"));
    }

    #[test]
    fn test_cat_prints_messages_in_order() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, &["first", "second"]);

        let mut out = Vec::new();
        cat(&path, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut out = Vec::new();
        let err = info(&dir.path().join("syslog-ng-00042.qf"), &mut out).unwrap_err();
        assert!(err.to_string().contains("syslog-ng-00042.qf"));
    }
}
