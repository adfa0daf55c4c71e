//! Frame file naming.
//!
//! The first run of `#` in a pattern becomes the frame number, zero-padded to
//! the run's width. Without any `#`, four digits go before the extension.

use renderfarm::FrameIndex;

const DEFAULT_WIDTH: usize = 4;

pub fn frame_path(pattern: &str, frame: FrameIndex) -> String {
    if let Some(start) = pattern.find('#') {
        let width = pattern[start..].bytes().take_while(|b| *b == b'#').count();
        return format!(
            "{}{:0width$}{}",
            &pattern[..start],
            frame,
            &pattern[start + width..]
        );
    }

    let name_start = pattern.rfind(['/', '\\']).map_or(0, |i| i + 1);
    match pattern[name_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let dot = name_start + dot;
            format!(
                "{}{:0DEFAULT_WIDTH$}{}",
                &pattern[..dot],
                frame,
                &pattern[dot..]
            )
        }
        _ => format!("{pattern}{frame:0DEFAULT_WIDTH$}"),
    }
}
