//! User agent server: the TU side of one incoming request
//!
//! Each operation builds the response for its status class and hands it to
//! the owned server transaction, which decides whether the response is
//! allowed in its current state:
//!
//! | operation  | statuses | methods      |
//! |------------|----------|--------------|
//! | `trying`   | 100      | any          |
//! | `progress` | 101-199  | INVITE only  |
//! | `accept`   | 2xx      | any          |
//! | `redirect` | 3xx      | any          |
//! | `reject`   | 4xx-6xx  | any          |
//!
//! The `build_*` variants only construct the response so the user agent
//! core can involve the dialog (reliable provisionals, offer/answer) before
//! calling [`send`](UserAgentServer::send).

use std::ops::RangeInclusive;

use tracing::debug;

use sipflow_sip_core::prelude::*;

use crate::dialog::DialogId;
use crate::errors::{DialogError, DialogResult, TransactionError};
use crate::transaction::utils::create_response;
use crate::transaction::{ServerTransaction, Transaction, TransactionIo, TransactionKey, TransactionState};
use crate::user_agent::options::ResponseOptions;

#[derive(Debug)]
pub struct UserAgentServer {
    transaction: ServerTransaction,
    local_tag: String,
    contact: NameAddr,
    server_header: String,
    /// Dialog the request arrived in, or the one answering it created
    pub(crate) dialog_id: Option<DialogId>,
}

impl UserAgentServer {
    /// Wraps a server transaction. The To-tag of an in-dialog request is
    /// kept; otherwise a fresh one is used for every response.
    pub(crate) fn new(transaction: ServerTransaction, contact: NameAddr, server_header: impl Into<String>) -> Self {
        let local_tag = transaction
            .request()
            .to_tag()
            .map(str::to_string)
            .unwrap_or_else(generate_tag);
        Self {
            transaction,
            local_tag,
            contact,
            server_header: server_header.into(),
            dialog_id: None,
        }
    }

    pub fn key(&self) -> &TransactionKey {
        self.transaction.key()
    }

    pub fn request(&self) -> &Request {
        self.transaction.request()
    }

    /// To-tag used in our responses
    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn state(&self) -> TransactionState {
        self.transaction.state()
    }

    pub fn transaction(&self) -> &ServerTransaction {
        &self.transaction
    }

    pub(crate) fn transaction_mut(&mut self) -> &mut ServerTransaction {
        &mut self.transaction
    }

    pub fn is_terminated(&self) -> bool {
        self.transaction.is_terminated()
    }

    /// Still able to send a final response
    pub fn is_pending(&self) -> bool {
        matches!(self.state(), TransactionState::Trying | TransactionState::Proceeding)
    }

    fn check(&self, operation: &'static str, status: u16, allowed: RangeInclusive<u16>) -> DialogResult<StatusCode> {
        if !self.is_pending() {
            return Err(TransactionError::InvalidState {
                kind: self.transaction.kind(),
                state: self.state(),
                operation,
            }
            .into());
        }
        let status = StatusCode::new(status)?;
        if !allowed.contains(&status.as_u16()) {
            return Err(TransactionError::InvalidStatus {
                status,
                reason: "status class does not match the operation",
            }
            .into());
        }
        Ok(status)
    }

    fn build(&self, status: StatusCode, options: &ResponseOptions) -> Response {
        let request = self.transaction.request();
        let mut response = create_response(request, status, Some(&self.local_tag));
        response.headers.set(HeaderName::Server, self.server_header.clone());
        let code = status.as_u16();
        if code > 100 && code < 300 && request.method.creates_dialog() {
            response.headers.contact = vec![self.contact.clone()];
        }
        options.apply(&mut response);
        response
    }

    pub fn build_progress(&self, status: u16, options: &ResponseOptions) -> DialogResult<Response> {
        if self.request().method != Method::Invite {
            return Err(DialogError::invalid_state(format!(
                "progress is not available for {} requests",
                self.request().method
            )));
        }
        let status = self.check("progress", status, 101..=199)?;
        Ok(self.build(status, options))
    }

    pub fn build_accept(&self, status: u16, options: &ResponseOptions) -> DialogResult<Response> {
        let status = self.check("accept", status, 200..=299)?;
        Ok(self.build(status, options))
    }

    pub fn build_redirect(&self, status: u16, options: &ResponseOptions) -> DialogResult<Response> {
        let status = self.check("redirect", status, 300..=399)?;
        Ok(self.build(status, options))
    }

    pub fn build_reject(&self, status: u16, options: &ResponseOptions) -> DialogResult<Response> {
        let status = self.check("reject", status, 400..=699)?;
        Ok(self.build(status, options))
    }

    /// Hands a response to the server transaction
    pub fn send(&mut self, response: Response, io: &mut dyn TransactionIo) -> DialogResult<()> {
        debug!(tx = %self.key(), "Sending {} {}", response.status, response.reason);
        self.transaction.respond(response, io)?;
        Ok(())
    }

    pub fn trying(&mut self, io: &mut dyn TransactionIo) -> DialogResult<()> {
        let status = self.check("trying", 100, 100..=100)?;
        let response = self.build(status, &ResponseOptions::default());
        self.send(response, io)
    }

    pub fn progress(&mut self, status: u16, options: &ResponseOptions, io: &mut dyn TransactionIo) -> DialogResult<Response> {
        let response = self.build_progress(status, options)?;
        self.send(response.clone(), io)?;
        Ok(response)
    }

    pub fn accept(&mut self, status: u16, options: &ResponseOptions, io: &mut dyn TransactionIo) -> DialogResult<Response> {
        let response = self.build_accept(status, options)?;
        self.send(response.clone(), io)?;
        Ok(response)
    }

    pub fn redirect(&mut self, status: u16, options: &ResponseOptions, io: &mut dyn TransactionIo) -> DialogResult<Response> {
        let response = self.build_redirect(status, options)?;
        self.send(response.clone(), io)?;
        Ok(response)
    }

    pub fn reject(&mut self, status: u16, options: &ResponseOptions, io: &mut dyn TransactionIo) -> DialogResult<Response> {
        let response = self.build_reject(status, options)?;
        self.send(response.clone(), io)?;
        Ok(response)
    }

    pub(crate) fn dispose(&mut self, io: &mut dyn TransactionIo) {
        self.transaction.dispose(io);
    }
}
