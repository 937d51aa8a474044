#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatAuthor {
    Local,
    Partner,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub id: u64,
    pub author: ChatAuthor,
    pub text: String,
}

/// Append-only between clears. Ids keep increasing across clears so a UI
/// can key rows by id.
#[derive(Debug, Default)]
pub struct ChatLog {
    next_id: u64,
    entries: Vec<ChatEntry>,
}

impl ChatLog {
    pub fn push(&mut self, author: ChatAuthor, text: impl Into<String>) -> ChatEntry {
        self.next_id += 1;
        let entry = ChatEntry {
            id: self.next_id,
            author,
            text: text.into(),
        };
        self.entries.push(entry.clone());
        entry
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
