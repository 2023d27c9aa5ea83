//! Streaming search results.

use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::filter::Filter;
use crate::protocol::{Control, DerefAliases, LdapResult, Scope, SearchEntry};

/// One event on a search stream. `Done` is terminal; with paged results it
/// is delivered once, after the last page.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchItem {
    Entry(SearchEntry),
    Referral(Vec<String>),
    Done(LdapResult),
}

/// Receiver side of one logical search. Events arrive in server order;
/// exactly one terminal (`Done` or `Err`) ends the stream.
pub struct SearchStream {
    rx: mpsc::UnboundedReceiver<Result<SearchItem>>,
    done: bool,
    id_rx: Option<oneshot::Receiver<i32>>,
    id: Option<i32>,
}

impl SearchStream {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Result<SearchItem>>,
        id_rx: oneshot::Receiver<i32>,
    ) -> Self {
        SearchStream {
            rx,
            done: false,
            id_rx: Some(id_rx),
            id: None,
        }
    }

    /// Message id of the search request, for [`abandon`]. Available once
    /// the request has been written (immediately when connected, after the
    /// queue flushes otherwise); `None` if the request never made it out.
    ///
    /// [`abandon`]: crate::LdapClient::abandon
    pub async fn message_id(&mut self) -> Option<i32> {
        if self.id.is_none() {
            if let Some(rx) = self.id_rx.take() {
                self.id = rx.await.ok();
            }
        }
        self.id
    }

    /// Next event, or `None` once the terminal has been delivered.
    pub async fn next(&mut self) -> Option<Result<SearchItem>> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(item) => {
                if matches!(item, Ok(SearchItem::Done(_)) | Err(_)) {
                    self.done = true;
                }
                Some(item)
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Drain the stream, collecting entries and the final result.
    /// Referrals are skipped.
    pub async fn collect(mut self) -> Result<(Vec<SearchEntry>, LdapResult)> {
        let mut entries = Vec::new();
        while let Some(item) = self.next().await {
            match item? {
                SearchItem::Entry(entry) => entries.push(entry),
                SearchItem::Referral(_) => {}
                SearchItem::Done(result) => return Ok((entries, result)),
            }
        }
        Err(crate::error::LdapError::Connection(
            "search ended without a result".to_string(),
        ))
    }
}

/// Search parameters. Defaults follow the protocol conventions: base scope,
/// `(objectClass=*)` filter, time limit 10, no size limit, never dereference.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub base: String,
    pub scope: Scope,
    pub deref: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Option<Filter>,
    pub filter_str: Option<String>,
    pub attributes: Vec<String>,
    pub controls: Vec<Control>,
}

impl SearchOptions {
    pub fn new(base: impl Into<String>) -> Self {
        SearchOptions {
            base: base.into(),
            scope: Scope::Base,
            deref: DerefAliases::Never,
            size_limit: 0,
            time_limit: 10,
            types_only: false,
            filter: None,
            filter_str: None,
            attributes: Vec::new(),
            controls: Vec::new(),
        }
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// RFC 4515 filter string; parsed when the search is issued.
    pub fn filter_str(mut self, filter: impl Into<String>) -> Self {
        self.filter_str = Some(filter.into());
        self
    }

    pub fn attributes<S: Into<String>>(mut self, attrs: impl IntoIterator<Item = S>) -> Self {
        self.attributes = attrs.into_iter().map(Into::into).collect();
        self
    }

    pub fn size_limit(mut self, limit: i32) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn time_limit(mut self, limit: i32) -> Self {
        self.time_limit = limit;
        self
    }

    pub fn types_only(mut self, value: bool) -> Self {
        self.types_only = value;
        self
    }

    pub fn deref(mut self, deref: DerefAliases) -> Self {
        self.deref = deref;
        self
    }

    pub fn control(mut self, control: Control) -> Self {
        self.controls.push(control);
        self
    }

    /// Attach a PagedResults control; the client then drives the paging
    /// cookie transparently and the stream spans all pages.
    pub fn paged(self, page_size: i32) -> Self {
        self.control(Control::paged(page_size))
    }
}
