//! UTF-16 command-line assembly with the quoting rules `CommandLineToArgvW`
//! expects on the other side.

use crate::Error;

/// Joins `argv` into a NUL-terminated UTF-16 command line, quoting each
/// element that needs it.
pub(crate) fn build_command_line<S: AsRef<str>>(argv: &[S]) -> Result<Vec<u16>, Error> {
  let mut out = Vec::new();
  for (i, arg) in argv.iter().enumerate() {
    let arg = arg.as_ref();
    if arg.contains('\0') {
      return Err(Error::invalid("argv contains an interior NUL byte"));
    }
    if i > 0 {
      out.push(b' ' as u16);
    }
    append_arg(&mut out, arg);
  }
  out.push(0);
  Ok(out)
}

fn needs_quoting(arg: &str) -> bool {
  arg.is_empty() || arg.chars().any(|c| c == ' ' || c == '\t' || c == '"')
}

/// Appends one argument, applying the backslash-doubling rule: a run of
/// backslashes before a `"` is doubled and the quote itself escaped; a run
/// of trailing backslashes inside a quoted argument is doubled so the
/// closing quote survives.
fn append_arg(out: &mut Vec<u16>, arg: &str) {
  if !needs_quoting(arg) {
    out.extend(arg.encode_utf16());
    return;
  }
  out.push(b'"' as u16);
  let mut backslashes = 0usize;
  for c in arg.chars() {
    if c == '\\' {
      backslashes += 1;
      continue;
    }
    if c == '"' {
      out.extend(std::iter::repeat(b'\\' as u16).take(backslashes * 2 + 1));
      backslashes = 0;
      out.push(b'"' as u16);
      continue;
    }
    if backslashes > 0 {
      out.extend(std::iter::repeat(b'\\' as u16).take(backslashes));
      backslashes = 0;
    }
    let mut units = [0u16; 2];
    out.extend_from_slice(c.encode_utf16(&mut units));
  }
  if backslashes > 0 {
    out.extend(std::iter::repeat(b'\\' as u16).take(backslashes * 2));
  }
  out.push(b'"' as u16);
}

#[cfg(test)]
mod tests {
  use super::build_command_line;

  fn line(argv: &[&str]) -> String {
    let wide = build_command_line(argv).unwrap();
    String::from_utf16(&wide[..wide.len() - 1]).unwrap()
  }

  #[test]
  fn plain_args_pass_through() {
    assert_eq!(line(&["cmd", "/C", "exit"]), "cmd /C exit");
  }

  #[test]
  fn empty_arg_becomes_quotes() {
    assert_eq!(line(&["prog", ""]), r#"prog """#);
  }

  #[test]
  fn spaces_force_quotes() {
    assert_eq!(line(&["prog", "a b"]), r#"prog "a b""#);
  }

  #[test]
  fn embedded_quote_is_escaped() {
    assert_eq!(line(&["prog", r#"say "hi""#]), r#"prog "say \"hi\"""#);
  }

  #[test]
  fn backslashes_before_quote_double() {
    assert_eq!(line(&["prog", r#"a\"b"#]), r#"prog "a\\\"b""#);
  }

  #[test]
  fn trailing_backslashes_double_inside_quotes() {
    assert_eq!(line(&["prog", r"dir with space\"]), r#"prog "dir with space\\""#);
  }

  #[test]
  fn bare_backslashes_untouched_without_quoting() {
    assert_eq!(line(&["prog", r"C:\tmp\x"]), r"prog C:\tmp\x");
  }

  #[test]
  fn interior_nul_is_rejected() {
    assert!(build_command_line(&["prog", "a\0b"]).is_err());
  }
}
