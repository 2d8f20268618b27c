pub mod nw;
