/// Watches a value and reports transitions.
///
/// The coordinator keeps one for the link state, where only changes are worth
/// recording.
#[derive(Clone, Debug)]
pub struct ChangeDetector<T: PartialEq + Clone> {
    current: Option<T>,
}

impl<T: PartialEq + Clone> ChangeDetector<T> {
    pub fn new_with_initial_state(val: &T) -> Self {
        Self {
            current: Some(val.clone()),
        }
    }

    /// Store `val`. Returns the previous value if it differs from `val`.
    pub fn update(&mut self, val: &T) -> Option<T> {
        match self.current.replace(val.clone()) {
            Some(old) if old != *val => Some(old),
            _ => None,
        }
    }
}

pub type MyTimestamp = chrono::DateTime<chrono::Local>;

pub fn now() -> MyTimestamp {
    chrono::Local::now()
}
