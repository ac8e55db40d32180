use crate::error::FsResult;
use crate::store::{Entry, EntryId, MetadataStore};

/// Walks the children of a directory page by page, fetching the next page only
/// when the current one is used up.
pub struct ChildrenIter<'a> {
    store: &'a MetadataStore,
    parent: EntryId,
    after: Option<EntryId>,
    page_size: usize,
    page: std::vec::IntoIter<Entry>,
    done: bool,
}

impl<'a> ChildrenIter<'a> {
    pub(crate) fn new(store: &'a MetadataStore, parent: EntryId, page_size: usize) -> Self {
        Self {
            store,
            parent,
            after: None,
            page_size: page_size.max(1),
            page: Vec::new().into_iter(),
            done: false,
        }
    }
}

impl Iterator for ChildrenIter<'_> {
    type Item = FsResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.page.next() {
                self.after = Some(entry.id);
                return Some(Ok(entry));
            }
            if self.done {
                return None;
            }
            match self
                .store
                .list_children(self.parent, self.after, self.page_size)
            {
                Ok(page) => {
                    if page.len() < self.page_size {
                        self.done = true;
                    }
                    if page.is_empty() {
                        return None;
                    }
                    self.page = page.into_iter();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
