//! Fixtures shared by the benchmarks.

/// How a request is handed to the parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feed {
    /// One call with the whole buffer.
    Whole,
    /// Consecutive calls of at most `n` bytes.
    Chunked(usize),
}

impl Feed {
    pub fn chunk_size(self, len: usize) -> usize {
        match self {
            Feed::Whole => len.max(1),
            Feed::Chunked(n) => n.max(1),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TestCase {
    name: &'static str,
    feed: Feed,
    file: TestFile,
}

impl TestCase {
    pub fn new(name: &'static str, feed: Feed, file: TestFile) -> Self {
        Self { name, feed, file }
    }

    pub fn whole(name: &'static str, file: TestFile) -> Self {
        Self::new(name, Feed::Whole, file)
    }

    pub fn byte_by_byte(name: &'static str, file: TestFile) -> Self {
        Self::new(name, Feed::Chunked(1), file)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn feed(&self) -> Feed {
        self.feed
    }

    pub fn file(&self) -> &TestFile {
        &self.file
    }
}

/// A request fixture, stored with `\n` line endings.
#[derive(Debug, Copy, Clone)]
pub struct TestFile {
    file_name: &'static str,
    content: &'static str,
}

impl TestFile {
    pub const fn new(file_name: &'static str, content: &'static str) -> Self {
        Self { file_name, content }
    }

    pub fn file_name(&self) -> &'static str {
        self.file_name
    }

    /// The request as sent on the wire, with `\r\n` line endings.
    pub fn request(&self) -> Vec<u8> {
        self.content.replace("\r\n", "\n").replace('\n', "\r\n").into_bytes()
    }
}
