//! Opening of term files, plain or gzip-compressed depending on the extension.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::{bufread::MultiGzDecoder, write::GzEncoder, Compression};

/// Compression of a file as told by its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Plain,
    /// `.gz` and `.bgz`, read as multi-member gzip.
    Gzip,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("gz") | Some("bgz") => FileFormat::Gzip,
            _ => FileFormat::Plain,
        }
    }
}

/// Open `path` for buffered reading, decompressing by extension.
pub fn open_read_maybe_gz<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>, anyhow::Error> {
    let path = path.as_ref();
    let format = FileFormat::from_path(path);
    tracing::trace!("opening {:?} for reading ({:?})", path, format);
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("could not open {:?} for reading: {}", path, e))?;
    Ok(match format {
        FileFormat::Gzip => Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file)))),
        FileFormat::Plain => Box::new(BufReader::new(file)),
    })
}

/// Create `path` for buffered writing, compressing by extension.
///
/// The gzip trailer is written when the returned writer is dropped.
pub fn open_write_maybe_gz<P: AsRef<Path>>(path: P) -> Result<Box<dyn Write>, anyhow::Error> {
    let path = path.as_ref();
    let format = FileFormat::from_path(path);
    tracing::trace!("opening {:?} for writing ({:?})", path, format);
    let file = BufWriter::new(
        File::create(path)
            .map_err(|e| anyhow::anyhow!("could not open {:?} for writing: {}", path, e))?,
    );
    Ok(match format {
        FileFormat::Gzip => Box::new(GzEncoder::new(file, Compression::default())),
        FileFormat::Plain => Box::new(file),
    })
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use super::FileFormat;

    #[rstest::rstest]
    #[case("terms.txt", FileFormat::Plain)]
    #[case("terms.txt.gz", FileFormat::Gzip)]
    #[case("terms.bgz", FileFormat::Gzip)]
    #[case("gz", FileFormat::Plain)]
    #[case("terms.gz.txt", FileFormat::Plain)]
    fn format_from_path(#[case] path: &str, #[case] expected: FileFormat) {
        assert_eq!(FileFormat::from_path(Path::new(path)), expected);
    }

    #[test]
    fn missing_file_names_path() {
        let err = match super::open_read_maybe_gz("tests/does-not-exist.txt") {
            Ok(_) => panic!("must fail"),
            Err(e) => e,
        };

        assert!(err.to_string().contains("does-not-exist.txt"), "{}", err);
    }

    #[rstest::rstest]
    #[case("terms.txt")]
    #[case("terms.txt.gz")]
    fn write_then_read_maybe_gz(#[case] filename: &str) -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join(filename);

        {
            let mut f = super::open_write_maybe_gz(&path)?;
            f.write_all(b"MAN_0001-01\nCriterion,Frequency\nhp0012531_Pain,16\n")?;
            f.flush()?;
        }

        let mut buf = String::new();
        super::open_read_maybe_gz(&path)?.read_to_string(&mut buf)?;
        assert_eq!(
            buf,
            "MAN_0001-01\nCriterion,Frequency\nhp0012531_Pain,16\n"
        );

        Ok(())
    }

    #[test]
    fn gz_file_is_compressed() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("x.txt.gz");
        {
            let mut f = super::open_write_maybe_gz(&path)?;
            f.write_all(b"hello")?;
        }

        let raw = std::fs::read(&path)?;
        assert_eq!(&raw[0..2], &[0x1f, 0x8b]);

        Ok(())
    }
}
