use quick_error::quick_error;

quick_error! {
    #[derive(Debug, PartialEq, Eq)]
    pub enum SetError {
        // A key that does not lie strictly between the sentinel bounds can
        // never be stored; rejected at the call boundary, before any
        // traversal starts
        InvalidKey {
            display("key falls outside the sentinel bounds of the set")
        }
    }
}

pub type Result<T> = std::result::Result<T, SetError>;
