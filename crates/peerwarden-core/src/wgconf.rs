//! Line-preserving reader/writer for wg-quick style configuration files.
//!
//! Files are split into blocks: an optional preamble followed by one block
//! per `[Section]`. Comment lines directly above a section header travel
//! with that section, so removing a `[Peer]` also removes its `# name`
//! comment. Keys are matched case-insensitively because these files are also
//! written by hand and by other tools.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Preamble,
    Interface,
    Peer,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: SectionKind,
    pub comments: Vec<String>,
    header: Option<String>,
    lines: Vec<String>,
}

fn section_kind(header: &str) -> SectionKind {
    let name = header.trim().trim_start_matches('[').trim_end_matches(']').trim();
    if name.eq_ignore_ascii_case("interface") {
        SectionKind::Interface
    } else if name.eq_ignore_ascii_case("peer") {
        SectionKind::Peer
    } else {
        SectionKind::Other
    }
}

fn is_header(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('[') && t.ends_with(']')
}

fn is_comment(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('#') || t.starts_with(';')
}

fn split_kv(line: &str) -> Option<(&str, &str)> {
    if is_comment(line) || is_header(line) {
        return None;
    }
    let (k, v) = line.split_once('=')?;
    Some((k.trim(), v.trim()))
}

impl Block {
    pub fn new(kind: SectionKind) -> Self {
        let header = match kind {
            SectionKind::Interface => Some("[Interface]".to_string()),
            SectionKind::Peer => Some("[Peer]".to_string()),
            SectionKind::Preamble | SectionKind::Other => None,
        };
        Self {
            kind,
            comments: Vec::new(),
            header,
            lines: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .filter_map(|l| split_kv(l))
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// Replace the first `key = ...` line, or append one.
    pub fn set(&mut self, key: &str, value: &str) {
        let line = format!("{key} = {value}");
        let existing = self
            .lines
            .iter()
            .position(|l| split_kv(l).is_some_and(|(k, _)| k.eq_ignore_ascii_case(key)));
        match existing {
            Some(i) => self.lines[i] = line,
            None => {
                let insert_at = self
                    .lines
                    .iter()
                    .rposition(|l| !l.trim().is_empty())
                    .map_or(0, |i| i + 1);
                self.lines.insert(insert_at, line);
            }
        }
    }

    pub fn push(&mut self, key: &str, value: &str) {
        self.lines.push(format!("{key} = {value}"));
    }

    /// The peer name carried by the last comment above the header.
    ///
    /// Accepts both `# laptop` and `# Name = laptop`.
    pub fn name(&self) -> Option<&str> {
        let last = self.comments.iter().rev().find(|c| is_comment(c))?;
        let body = last.trim_start().trim_start_matches(['#', ';']).trim();
        let name = match body.split_once('=') {
            Some((k, v)) if k.trim().eq_ignore_ascii_case("name") => v.trim(),
            _ => body,
        };
        (!name.is_empty()).then_some(name)
    }

    pub fn set_name(&mut self, name: &str) {
        self.comments.retain(|c| !is_comment(c));
        self.comments.push(format!("# {name}"));
    }

    fn render_into(&self, out: &mut Vec<String>) {
        out.extend(self.comments.iter().cloned());
        if let Some(ref h) = self.header {
            out.push(h.clone());
        }
        out.extend(self.lines.iter().cloned());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfFile {
    pub blocks: Vec<Block>,
}

impl ConfFile {
    pub fn parse(text: &str) -> Self {
        let mut blocks = Vec::new();
        let mut current = Block::new(SectionKind::Preamble);
        let mut pending: Vec<String> = Vec::new();

        for line in text.lines() {
            if is_header(line) {
                // Comments after the last blank line belong to the new section.
                let split = pending
                    .iter()
                    .rposition(|l| l.trim().is_empty())
                    .map_or(0, |i| i + 1);
                let comments = pending.split_off(split);
                current.lines.append(&mut pending);
                blocks.push(current);
                current = Block {
                    kind: section_kind(line),
                    comments,
                    header: Some(line.to_string()),
                    lines: Vec::new(),
                };
            } else if line.trim().is_empty() || is_comment(line) {
                pending.push(line.to_string());
            } else {
                current.lines.append(&mut pending);
                current.lines.push(line.to_string());
            }
        }
        current.lines.append(&mut pending);
        blocks.push(current);

        // An empty preamble carries nothing worth keeping.
        if blocks
            .first()
            .is_some_and(|b| b.kind == SectionKind::Preamble && b.lines.is_empty())
        {
            blocks.remove(0);
        }
        Self { blocks }
    }

    pub fn render(&self) -> String {
        let mut out = Vec::new();
        for block in &self.blocks {
            block.render_into(&mut out);
        }
        let mut text = out.join("\n");
        text.push('\n');
        text
    }

    pub fn interface(&self) -> Option<&Block> {
        self.blocks.iter().find(|b| b.kind == SectionKind::Interface)
    }

    pub fn interface_mut(&mut self) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.kind == SectionKind::Interface)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.kind == SectionKind::Peer)
    }

    pub fn peer_mut(&mut self, public_key: &str) -> Option<&mut Block> {
        self.blocks
            .iter_mut()
            .find(|b| b.kind == SectionKind::Peer && b.get("PublicKey") == Some(public_key))
    }

    /// Remove every `[Peer]` with this key. Returns whether anything changed.
    pub fn remove_peer(&mut self, public_key: &str) -> bool {
        let before = self.blocks.len();
        self.blocks
            .retain(|b| !(b.kind == SectionKind::Peer && b.get("PublicKey") == Some(public_key)));
        before != self.blocks.len()
    }

    /// Append a peer block, separated from the previous one by a blank line.
    pub fn push_peer(&mut self, block: Block) {
        if let Some(last) = self.blocks.last_mut() {
            if last.lines.last().is_some_and(|l| !l.trim().is_empty()) {
                last.lines.push(String::new());
            }
        }
        self.blocks.push(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHARED: &str = "\
[Interface]
Address = 10.100.0.1/24
ListenPort = 51820
PrivateKey = c2VydmVy

# laptop
[Peer]
PublicKey = AAA=
AllowedIPs = 10.100.0.2/32

# Name = phone
[Peer]
publickey = BBB=
allowedips = 10.100.0.3/32
";

    #[test]
    fn parses_sections_and_names() {
        let conf = ConfFile::parse(SHARED);
        assert_eq!(conf.interface().unwrap().get("address"), Some("10.100.0.1/24"));
        let peers: Vec<_> = conf.peers().collect();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].name(), Some("laptop"));
        assert_eq!(peers[1].name(), Some("phone"));
        assert_eq!(peers[1].get("PublicKey"), Some("BBB="));
        assert_eq!(peers[1].get("AllowedIPs"), Some("10.100.0.3/32"));
    }

    #[test]
    fn render_preserves_text() {
        assert_eq!(ConfFile::parse(SHARED).render(), SHARED);
    }

    #[test]
    fn remove_peer_takes_its_comment() {
        let mut conf = ConfFile::parse(SHARED);
        assert!(conf.remove_peer("AAA="));
        assert!(!conf.remove_peer("AAA="));
        let text = conf.render();
        assert!(!text.contains("laptop"));
        assert!(!text.contains("AAA="));
        assert!(text.contains("# Name = phone"));
    }

    #[test]
    fn push_peer_appends_block() {
        let mut conf = ConfFile::parse(SHARED);
        let mut block = Block::new(SectionKind::Peer);
        block.set_name("tablet");
        block.push("PublicKey", "CCC=");
        block.push("AllowedIPs", "10.100.0.4/32");
        conf.push_peer(block);

        let reparsed = ConfFile::parse(&conf.render());
        let last = reparsed.peers().last().unwrap();
        assert_eq!(last.name(), Some("tablet"));
        assert_eq!(last.get("AllowedIPs"), Some("10.100.0.4/32"));
        assert!(conf.render().contains("10.100.0.3/32\n\n# tablet\n[Peer]"));
    }

    #[test]
    fn set_replaces_existing_key() {
        let mut conf = ConfFile::parse(SHARED);
        conf.interface_mut().unwrap().set("address", "10.100.0.1/22");
        let text = conf.render();
        assert!(text.contains("address = 10.100.0.1/22"));
        assert!(!text.contains("Address = 10.100.0.1/24"));
    }

    #[test]
    fn rename_peer_comment() {
        let mut conf = ConfFile::parse(SHARED);
        conf.peer_mut("AAA=").unwrap().set_name("work-laptop");
        let reparsed = ConfFile::parse(&conf.render());
        assert_eq!(reparsed.peers().next().unwrap().name(), Some("work-laptop"));
    }
}
