mod consumers;
mod helpers;
