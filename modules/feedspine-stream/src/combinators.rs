//! Lazy stream transforms. Cold: nothing runs until the output is
//! consumed. All preserve input order.

use std::future::Future;

use async_stream::stream;
use futures::pin_mut;
use futures::{Stream, StreamExt};

/// Yield `f(x)` for each `x` of `src`.
pub fn amap<S, F, Fut, U>(src: S, mut f: F) -> impl Stream<Item = U>
where
    S: Stream,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = U>,
{
    stream! {
        pin_mut!(src);
        while let Some(item) = src.next().await {
            yield f(item).await;
        }
    }
}

/// Yield only the `x` where `p(x)` holds.
pub fn afilter<S, P, Fut>(src: S, mut p: P) -> impl Stream<Item = S::Item>
where
    S: Stream,
    P: FnMut(&S::Item) -> Fut,
    Fut: Future<Output = bool>,
{
    stream! {
        pin_mut!(src);
        while let Some(item) = src.next().await {
            if p(&item).await {
                yield item;
            }
        }
    }
}

/// Group into Vecs of `n`; the last batch may be shorter. `n` of zero is
/// clamped to 1.
pub fn abatch<S>(src: S, n: usize) -> impl Stream<Item = Vec<S::Item>>
where
    S: Stream,
{
    let n = n.max(1);
    stream! {
        pin_mut!(src);
        let mut batch = Vec::with_capacity(n);
        while let Some(item) = src.next().await {
            batch.push(item);
            if batch.len() == n {
                yield std::mem::replace(&mut batch, Vec::with_capacity(n));
            }
        }
        if !batch.is_empty() {
            yield batch;
        }
    }
}

/// Run `effect(x)` for each `x`, then yield `x` unchanged.
pub fn atap<S, F, Fut>(src: S, mut effect: F) -> impl Stream<Item = S::Item>
where
    S: Stream,
    F: FnMut(&S::Item) -> Fut,
    Fut: Future<Output = ()>,
{
    stream! {
        pin_mut!(src);
        while let Some(item) = src.next().await {
            effect(&item).await;
            yield item;
        }
    }
}
