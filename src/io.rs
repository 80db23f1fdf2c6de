use std::fmt::Display;
use std::fs;
use std::io;
use std::time::Instant;

use camino::Utf8Path;
use console::Style;

const ANSI_BLUE: Style = Style::new().blue();

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Human readable duration of a box run, `12.3s, 0.2min`.
pub(crate) fn as_duration(s: Instant) -> String {
    let secs = s.elapsed().as_secs_f64();
    format!("{:.1}s, {:.1}min", secs, secs / 60.0)
}

/// Copies `src` over `dst` keeping the modification time of `src`.
pub(crate) fn copy_with_mtime(src: &Utf8Path, dst: &Utf8Path) -> io::Result<()> {
    fs::copy(src, dst)?;

    let modified = fs::metadata(src)?.modified()?;
    fs::File::options()
        .write(true)
        .open(dst)?
        .set_modified(modified)?;

    Ok(())
}

/// Whether new files may be created inside `dir`.
pub(crate) fn is_writable_dir(dir: &Utf8Path) -> bool {
    match fs::metadata(dir) {
        Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_copy_keeps_mtime() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
        let src = dir.join("src.txt");
        let dst = dir.join("dst.txt");

        fs::write(&src, "content").unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&src)
            .unwrap()
            .set_modified(past)
            .unwrap();

        copy_with_mtime(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(&dst).unwrap(), "content");
        assert_eq!(
            fs::metadata(&dst).unwrap().modified().unwrap(),
            fs::metadata(&src).unwrap().modified().unwrap()
        );
        assert!(is_writable_dir(&dir));
        assert!(!is_writable_dir(&dir.join("missing")));
    }
}
