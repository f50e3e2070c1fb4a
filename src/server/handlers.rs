//! Handler traits and their type-erased endpoints.
//!
//! A handler is resolved by the command's `NAME` at dispatch time. Handlers are
//! shared across concurrent calls and must not keep per-call state. Every
//! trait is also implemented for plain closures:
//!
//! ```ignore
//! let server = HandlerServer::new()
//!     .register::<CreateOrderCommand, _>(|cmd: CreateOrderCommand, _ctx| async move {
//!         Ok(CreateOrderResult { message: format!("Order {} created", cmd.order_id) })
//!     });
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, Stream, StreamExt};

use super::context::CallContext;
use crate::codec::{Envelope, Failure, Reply};
use crate::error::{category, HandlerError};
use crate::message::{ClientStreamItem, Command, ServerStreamCommand};

/// Items of a client stream as seen by its handler.
pub type ItemStream<I> = BoxStream<'static, Result<I, HandlerError>>;

/// Executes one command type.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    async fn execute(&self, command: C, ctx: CallContext) -> Result<C::Result, HandlerError>;
}

#[async_trait]
impl<C, F, Fut> CommandHandler<C> for F
where
    C: Command,
    F: Fn(C, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C::Result, HandlerError>> + Send + 'static,
{
    async fn execute(&self, command: C, ctx: CallContext) -> Result<C::Result, HandlerError> {
        self(command, ctx).await
    }
}

/// Answers one command with a lazy sequence of items.
///
/// The stream is dropped when the caller stops reading.
pub trait ServerStreamHandler<C: ServerStreamCommand>: Send + Sync + 'static {
    fn stream(&self, command: C, ctx: CallContext) -> ItemStream<C::Item>;
}

impl<C, F, S> ServerStreamHandler<C> for F
where
    C: ServerStreamCommand,
    F: Fn(C, CallContext) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<C::Item, HandlerError>> + Send + 'static,
{
    fn stream(&self, command: C, ctx: CallContext) -> ItemStream<C::Item> {
        self(command, ctx).boxed()
    }
}

/// Folds a client stream into one result once the caller closes it.
#[async_trait]
pub trait ClientStreamHandler<I: ClientStreamItem>: Send + Sync + 'static {
    async fn collect(&self, items: ItemStream<I>, ctx: CallContext)
        -> Result<I::Result, HandlerError>;
}

#[async_trait]
impl<I, F, Fut> ClientStreamHandler<I> for F
where
    I: ClientStreamItem,
    F: Fn(ItemStream<I>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<I::Result, HandlerError>> + Send + 'static,
{
    async fn collect(
        &self,
        items: ItemStream<I>,
        ctx: CallContext,
    ) -> Result<I::Result, HandlerError> {
        self(items, ctx).await
    }
}

// =============================================================================
// Type-erased endpoints
// =============================================================================

pub(crate) type UnaryFn = Arc<dyn Fn(Envelope, CallContext) -> BoxFuture<'static, Reply> + Send + Sync>;

pub(crate) type ClientStreamFn = Arc<
    dyn Fn(BoxStream<'static, Result<Envelope, HandlerError>>, CallContext) -> BoxFuture<'static, Reply>
        + Send
        + Sync,
>;

pub(crate) type ServerStreamFn =
    Arc<dyn Fn(Envelope, CallContext) -> BoxStream<'static, Reply> + Send + Sync>;

/// A registered handler, keyed by command type on the server.
#[derive(Clone)]
pub(crate) enum Endpoint {
    Unary(UnaryFn),
    ClientStream(ClientStreamFn),
    ServerStream(ServerStreamFn),
}

impl Endpoint {
    pub(crate) fn unary<C, H>(handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let handler = Arc::new(handler);
        Endpoint::Unary(Arc::new(move |envelope: Envelope, ctx: CallContext| {
            let handler = Arc::clone(&handler);
            async move {
                let command = match envelope.unpack_as::<C>(C::NAME) {
                    Ok(command) => command,
                    Err(e) => return Reply::failed(Failure::new(category::DECODE_FAILED, e.to_string())),
                };
                result_reply(C::NAME, handler.execute(command, ctx).await)
            }
            .boxed()
        }))
    }

    pub(crate) fn server_stream<C, H>(handler: H) -> Self
    where
        C: ServerStreamCommand,
        H: ServerStreamHandler<C>,
    {
        let handler = Arc::new(handler);
        Endpoint::ServerStream(Arc::new(move |envelope: Envelope, ctx: CallContext| {
            let command = match envelope.unpack_as::<C>(C::NAME) {
                Ok(command) => command,
                Err(e) => {
                    let reply = Reply::failed(Failure::new(category::DECODE_FAILED, e.to_string()));
                    return stream::once(future::ready(reply)).boxed();
                }
            };
            handler
                .stream(command, ctx)
                .map(|item| result_reply(C::NAME, item))
                // the first failure ends the stream
                .scan(false, |failed, reply| {
                    if *failed {
                        return future::ready(None);
                    }
                    *failed = !reply.is_ok();
                    future::ready(Some(reply))
                })
                .boxed()
        }))
    }

    pub(crate) fn client_stream<I, H>(handler: H) -> Self
    where
        I: ClientStreamItem,
        H: ClientStreamHandler<I>,
    {
        let handler = Arc::new(handler);
        Endpoint::ClientStream(Arc::new(
            move |items: BoxStream<'static, Result<Envelope, HandlerError>>, ctx: CallContext| {
                let handler = Arc::clone(&handler);
                async move {
                    let items: ItemStream<I> = items
                        .map(|item| item.and_then(|env| Ok(env.unpack_as::<I>(I::NAME)?)))
                        .boxed();
                    result_reply(I::NAME, handler.collect(items, ctx).await)
                }
                .boxed()
            },
        ))
    }

    pub(crate) fn shape(&self) -> &'static str {
        match self {
            Endpoint::Unary(_) => "unary",
            Endpoint::ClientStream(_) => "client_stream",
            Endpoint::ServerStream(_) => "server_stream",
        }
    }
}

/// Encode a handler outcome. Results are tagged with the command type.
fn result_reply<T: serde::Serialize>(name: &str, outcome: Result<T, HandlerError>) -> Reply {
    match outcome {
        Ok(value) => match Envelope::pack(name, &value) {
            Ok(envelope) => Reply::ok(envelope),
            Err(e) => Reply::failed(Failure::new(category::INTERNAL, e.to_string())),
        },
        Err(err) => Reply::failed(Failure::new(err.category(), err.to_string())),
    }
}
