mod odr;
mod retrieve;
