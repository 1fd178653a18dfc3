mod oanda;

pub use oanda::{OandaClient, QuoteProvider, PROVIDER_PAIRS};
