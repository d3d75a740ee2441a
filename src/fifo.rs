//! The FIFO of unwrapped slot indexes that make up sequences for writing to a file.
//!
//! For example:
//!
//! ```text
//! START, 100, 101, 102 ... 354, END,
//! START, 300, 301, 302 ... 405, END
//! ```
//!
//! Tokens are 32 bit: (2^31 / 384 kHz) * 32K samples is about 9 days of slots.

use rtrb::RingBuffer;

const END_SEQUENCE: i32 = -1;
const START_SEQUENCE: i32 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Start,
    End,
    /// Unwrapped index of a completed slot
    Slot(i32),
}

impl Token {
    pub fn encode(self) -> i32 {
        match self {
            Token::Start => START_SEQUENCE,
            Token::End => END_SEQUENCE,
            Token::Slot(index) => {
                debug_assert!(index >= 0);
                index
            }
        }
    }

    pub fn decode(raw: i32) -> Self {
        match raw {
            END_SEQUENCE => Token::End,
            START_SEQUENCE => Token::Start,
            index => Token::Slot(index),
        }
    }
}

/// Writing half, owned by interrupt context
#[derive(Debug)]
pub struct FifoWriter {
    producer: rtrb::Producer<i32>,
    capacity: usize,
}

/// Reading half, owned by the main loop
#[derive(Debug)]
pub struct FifoReader {
    consumer: rtrb::Consumer<i32>,
}

pub fn token_fifo(capacity: usize) -> (FifoWriter, FifoReader) {
    let (producer, consumer) = RingBuffer::<i32>::new(capacity);
    (
        FifoWriter { producer, capacity },
        FifoReader { consumer },
    )
}

impl FifoWriter {
    /// Capacity always exceeds the number of slots, so a full FIFO is a logic error
    pub fn put(&mut self, token: Token) {
        self.producer
            .push(token.encode())
            .expect("buffer fifo full, capacity must exceed the slot count");
    }

    /// Tokens written but not yet consumed
    pub fn len(&self) -> usize {
        self.capacity - self.producer.slots()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FifoReader {
    pub fn sniff(&self) -> Option<Token> {
        self.consumer.peek().ok().map(|raw| Token::decode(*raw))
    }

    pub fn get(&mut self) -> Option<Token> {
        self.consumer.pop().ok().map(Token::decode)
    }

    pub fn len(&self) -> usize {
        self.consumer.slots()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }
}
