//! Chainable pipeline builder over a boxed stream.
//!
//! Construction registers transforms; nothing executes until a terminal
//! operation (`collect`, `count`, `drain`) or `into_stream` consumption.

use std::future::Future;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::combinators::{abatch, afilter, amap, atap};

pub struct Pipeline<T> {
    stream: BoxStream<'static, T>,
}

impl<T: Send + 'static> Pipeline<T> {
    pub fn new(source: impl Stream<Item = T> + Send + 'static) -> Self {
        Self {
            stream: source.boxed(),
        }
    }

    pub fn map<U, F, Fut>(self, f: F) -> Pipeline<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = U> + Send + 'static,
    {
        Pipeline {
            stream: amap(self.stream, f).boxed(),
        }
    }

    pub fn filter<P, Fut>(self, p: P) -> Pipeline<T>
    where
        P: FnMut(&T) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Pipeline {
            stream: afilter(self.stream, p).boxed(),
        }
    }

    pub fn batch(self, n: usize) -> Pipeline<Vec<T>> {
        Pipeline {
            stream: abatch(self.stream, n).boxed(),
        }
    }

    pub fn tap<F, Fut>(self, effect: F) -> Pipeline<T>
    where
        F: FnMut(&T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Pipeline {
            stream: atap(self.stream, effect).boxed(),
        }
    }

    /// Terminal: materialize every item.
    pub async fn collect(self) -> Vec<T> {
        self.stream.collect().await
    }

    /// Terminal: consume and count.
    pub async fn count(mut self) -> usize {
        let mut n = 0;
        while self.stream.next().await.is_some() {
            n += 1;
        }
        n
    }

    /// Terminal: consume for side effects only.
    pub async fn drain(mut self) {
        while self.stream.next().await.is_some() {}
    }

    /// Escape hatch for callers that want the raw stream.
    pub fn into_stream(self) -> BoxStream<'static, T> {
        self.stream
    }
}
