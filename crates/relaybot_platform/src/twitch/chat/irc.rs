#![forbid(unsafe_code)]

/// One IRC line, borrowed from the socket frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct IrcLine<'a> {
	pub(crate) tags: Option<&'a str>,
	pub(crate) prefix: Option<&'a str>,
	pub(crate) command: &'a str,
	pub(crate) params: Vec<&'a str>,
}

impl<'a> IrcLine<'a> {
	pub(crate) fn parse(line: &'a str) -> Option<Self> {
		let mut rest = line.trim_end_matches(['\r', '\n']);
		if rest.is_empty() {
			return None;
		}

		let mut out = IrcLine::default();

		if let Some(stripped) = rest.strip_prefix('@') {
			let (tags, tail) = stripped.split_once(' ')?;
			out.tags = Some(tags);
			rest = tail;
		}

		if let Some(stripped) = rest.strip_prefix(':') {
			let (prefix, tail) = stripped.split_once(' ')?;
			out.prefix = Some(prefix);
			rest = tail;
		}

		let (head, trailing) = match rest.split_once(" :") {
			Some((head, trailing)) => (head, Some(trailing)),
			None => (rest, None),
		};

		let mut parts = head.split(' ').filter(|p| !p.is_empty());
		out.command = parts.next()?;
		out.params.extend(parts);
		out.params.extend(trailing);

		Some(out)
	}

	/// Tag value, unescaped per IRCv3.
	pub(crate) fn tag(&self, key: &str) -> Option<String> {
		let tags = self.tags?;
		tags.split(';').find_map(|component| {
			let (k, v) = component.split_once('=').unwrap_or((component, ""));
			(k == key).then(|| unescape_tag(v))
		})
	}

	/// Nick part of `nick!user@host`.
	pub(crate) fn nick(&self) -> Option<&'a str> {
		let prefix = self.prefix?;
		Some(prefix.split_once('!').map(|(n, _)| n).unwrap_or(prefix))
	}

	pub(crate) fn trailing(&self) -> Option<&'a str> {
		self.params.last().copied()
	}
}

fn unescape_tag(v: &str) -> String {
	let mut out = String::with_capacity(v.len());
	let mut chars = v.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}
