/// Retry-loop book-keeping for a single attempt. `halt` is set by
/// `on_error` middleware to mean "stop retrying and re-raise".
#[derive(Debug, Default)]
pub struct Attempt {
    pub attempt_number: u32,
    pub halt: bool,
}

impl Attempt {
    pub fn new(attempt_number: u32) -> Self {
        Self {
            attempt_number,
            halt: false,
        }
    }
}
