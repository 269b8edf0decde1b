//! §4.F — the `key=value[,key=value]*(;payload)?` command-body parser.

use log::warn;

/// The decoded fields of one command body (without the leading `G`).
/// Field names are descriptive; the doc comment on each names the wire
/// key letter from §4.F's table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// `a`: action.
    pub action: Option<char>,
    /// `t`: transmission medium.
    pub medium: Option<char>,
    /// `d`: delete specifier.
    pub delete_spec: Option<char>,
    /// `q`: quietness.
    pub quiet: Option<i64>,
    /// `f`: format.
    pub format: Option<i64>,
    /// `o`: compression (`z` only).
    pub compression: Option<char>,
    /// `s`: pixel width.
    pub pix_width: Option<i64>,
    /// `v`: pixel height.
    pub pix_height: Option<i64>,
    /// `x`: source rect x.
    pub src_x: Option<i64>,
    /// `y`: source rect y.
    pub src_y: Option<i64>,
    /// `w`: source rect width.
    pub src_width: Option<i64>,
    /// `h`: source rect height.
    pub src_height: Option<i64>,
    /// `c`: placement columns.
    pub cols: Option<i64>,
    /// `r`: placement rows.
    pub rows: Option<i64>,
    /// `i`: image id.
    pub image_id: Option<i64>,
    /// `I`: image number.
    pub image_number: Option<i64>,
    /// `p`: placement id.
    pub placement_id: Option<i64>,
    /// `m`: chunk continuation flag.
    pub more: Option<i64>,
    /// `S`: expected byte size.
    pub expected_size: Option<i64>,
    /// `U`: virtual-placement flag.
    pub virtual_placement: Option<i64>,
    /// `C`: do-not-move-cursor flag.
    pub do_not_move_cursor: Option<i64>,
    /// Raw bytes after `;`, NUL-terminated like the rest of the buffer.
    pub payload: Vec<u8>,
    /// Set when an unknown key or malformed value was seen; parsing
    /// continues regardless (§4.F, §7 "syntax" category).
    pub had_error: bool,
}

fn parse_int(raw: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(raw).ok()?;
    text.trim().parse::<i64>().ok()
}

fn parse_char(raw: &[u8]) -> Option<char> {
    raw.first().map(|&b| b as char)
}

fn apply(cmd: &mut ParsedCommand, key: u8, raw: &[u8]) {
    match key {
        b'a' => cmd.action = parse_char(raw),
        b't' => cmd.medium = parse_char(raw),
        b'd' => cmd.delete_spec = parse_char(raw),
        b'o' => cmd.compression = parse_char(raw),
        b'q' => cmd.quiet = reject_if_none(cmd, parse_int(raw)),
        b'f' => cmd.format = reject_if_none(cmd, parse_int(raw)),
        b's' => cmd.pix_width = reject_if_none(cmd, parse_int(raw)),
        b'v' => cmd.pix_height = reject_if_none(cmd, parse_int(raw)),
        b'x' => cmd.src_x = reject_if_none(cmd, parse_int(raw)),
        b'y' => cmd.src_y = reject_if_none(cmd, parse_int(raw)),
        b'w' => cmd.src_width = reject_if_none(cmd, parse_int(raw)),
        b'h' => cmd.src_height = reject_if_none(cmd, parse_int(raw)),
        b'c' => cmd.cols = reject_if_none(cmd, parse_int(raw)),
        b'r' => cmd.rows = reject_if_none(cmd, parse_int(raw)),
        b'i' => cmd.image_id = reject_if_none(cmd, parse_int(raw)),
        b'I' => cmd.image_number = reject_if_none(cmd, parse_int(raw)),
        b'p' => cmd.placement_id = reject_if_none(cmd, parse_int(raw)),
        b'm' => cmd.more = reject_if_none(cmd, parse_int(raw)),
        b'S' => cmd.expected_size = reject_if_none(cmd, parse_int(raw)),
        b'U' => cmd.virtual_placement = reject_if_none(cmd, parse_int(raw)),
        b'C' => cmd.do_not_move_cursor = reject_if_none(cmd, parse_int(raw)),
        b'X' | b'Y' | b'z' => {
            warn!("key {} recognized but unused", key as char);
        }
        other => {
            warn!("unknown command key {:?}", other as char);
            cmd.had_error = true;
        }
    }
}

fn reject_if_none(cmd: &mut ParsedCommand, value: Option<i64>) -> Option<i64> {
    if value.is_none() {
        cmd.had_error = true;
    }
    value
}

/// Tokenizes one command body per §4.F's two-state (`k`/`v`) walk.
#[must_use]
pub fn parse(buf: &[u8]) -> ParsedCommand {
    let mut cmd = ParsedCommand::default();
    let len = buf.len();
    let mut i = 0usize;

    while i < len && buf[i] != 0 {
        let key = buf[i];
        i += 1;
        if i < len && buf[i] == b'=' {
            i += 1;
        } else {
            cmd.had_error = true;
        }
        let value_start = i;
        while i < len && buf[i] != 0 && buf[i] != b',' && buf[i] != b';' {
            i += 1;
        }
        apply(&mut cmd, key, &buf[value_start..i]);

        if i >= len || buf[i] == 0 {
            return cmd;
        }
        if buf[i] == b';' {
            let payload_start = i + 1;
            let payload_end = buf[payload_start..]
                .iter()
                .position(|&b| b == 0)
                .map_or(len, |rel| payload_start + rel);
            cmd.payload = buf[payload_start..payload_end].to_vec();
            return cmd;
        }
        // buf[i] == b','
        i += 1;
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transmit_and_display_command() {
        let body = b"a=T,f=32,s=10,v=10,i=7,m=1;AAAA\0";
        let cmd = parse(body);
        assert_eq!(cmd.action, Some('T'));
        assert_eq!(cmd.format, Some(32));
        assert_eq!(cmd.pix_width, Some(10));
        assert_eq!(cmd.pix_height, Some(10));
        assert_eq!(cmd.image_id, Some(7));
        assert_eq!(cmd.more, Some(1));
        assert_eq!(cmd.payload, b"AAAA");
        assert!(!cmd.had_error);
    }

    #[test]
    fn unknown_key_sets_had_error_but_parsing_continues() {
        let body = b"a=p,Z=3,i=1\0";
        let cmd = parse(body);
        assert!(cmd.had_error);
        assert_eq!(cmd.action, Some('p'));
        assert_eq!(cmd.image_id, Some(1));
    }

    #[test]
    fn recognized_but_unused_keys_do_not_set_had_error() {
        let body = b"a=p,X=1,Y=2,z=3,i=1\0";
        let cmd = parse(body);
        assert!(!cmd.had_error);
        assert_eq!(cmd.image_id, Some(1));
    }

    #[test]
    fn stops_at_nul_without_payload() {
        let body = b"a=d\0garbage";
        let cmd = parse(body);
        assert_eq!(cmd.action, Some('d'));
        assert!(cmd.payload.is_empty());
    }

    #[test]
    fn payload_terminates_at_embedded_nul() {
        let mut body = b"a=t,m=0;".to_vec();
        body.extend_from_slice(b"payload");
        body.push(0);
        body.extend_from_slice(b"trailing-garbage");
        let cmd = parse(&body);
        assert_eq!(cmd.payload, b"payload");
    }

    #[test]
    fn malformed_integer_value_sets_had_error() {
        let body = b"a=p,i=notanumber\0";
        let cmd = parse(body);
        assert!(cmd.had_error);
        assert_eq!(cmd.image_id, None);
    }

    #[test]
    fn empty_body_yields_default_command() {
        let cmd = parse(b"\0");
        assert_eq!(cmd, ParsedCommand::default());
    }
}
